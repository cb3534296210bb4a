//! Host tool availability for `machina health`.

use std::path::PathBuf;

#[cfg(target_os = "macos")]
pub const REQUIRED_TOOLS: &[&str] = &["qemu-system-x86_64", "qemu-img", "ssh", "scp"];

#[cfg(not(target_os = "macos"))]
pub const REQUIRED_TOOLS: &[&str] = &[
    "cloud-localds",
    "qemu-img",
    "qemu-system-x86_64",
    "scp",
    "ssh",
    "rsync",
    "ssh-keygen",
    "virt-install",
    "virsh",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCheck {
    pub name: &'static str,
    pub path: Option<PathBuf>,
}

impl ToolCheck {
    pub fn installed(&self) -> bool {
        self.path.is_some()
    }

    pub fn status(&self) -> &'static str {
        if self.installed() {
            "installed"
        } else {
            "not installed"
        }
    }
}

pub fn check_tools(tools: &[&'static str]) -> Vec<ToolCheck> {
    tools
        .iter()
        .map(|&name| ToolCheck {
            name,
            path: which::which(name).ok(),
        })
        .collect()
}

/// One `name: status` line per tool, names padded to a common width.
pub fn render(checks: &[ToolCheck]) -> String {
    let width = checks.iter().map(|c| c.name.len()).max().unwrap_or(0);
    checks
        .iter()
        .map(|c| format!("{:<width$}  {}\n", c.name, c.status()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_reported() {
        let checks = check_tools(&["machina-no-such-tool"]);
        assert_eq!(checks[0].status(), "not installed");
    }

    #[cfg(unix)]
    #[test]
    fn present_tool_reported() {
        let checks = check_tools(&["sh"]);
        assert!(checks[0].installed());
    }

    #[test]
    fn render_aligns_names() {
        let checks = vec![
            ToolCheck {
                name: "ssh",
                path: Some(PathBuf::from("/usr/bin/ssh")),
            },
            ToolCheck {
                name: "qemu-img",
                path: None,
            },
        ];
        assert_eq!(render(&checks), "ssh       installed\nqemu-img  not installed\n");
    }
}

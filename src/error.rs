use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = MachinaError> = std::result::Result<T, E>;

#[derive(Debug, Error, Diagnostic)]
pub enum MachinaError {
    #[error("failed to parse template '{template}': {message}")]
    #[diagnostic(help("check the YAML syntax and field types of the template"))]
    Parse { template: String, message: String },

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("'{name}' not found")]
    NotFound { name: String },

    #[error("machine '{name}' already exists")]
    #[diagnostic(help("delete it first with `machina delete {name}`"))]
    AlreadyExists { name: String },

    #[error("unsupported kind '{kind}' in template '{template}'")]
    #[diagnostic(help("kind must be `Machine` or `Cluster`"))]
    UnsupportedKind { template: String, kind: String },

    #[error("template '{template}' extends itself through {chain}")]
    CyclicExtends { template: String, chain: String },

    #[error("invalid {field} '{value}'")]
    InvalidResource { field: String, value: String },

    #[error("timeout waiting for {name} at {address}")]
    Timeout { name: String, address: String },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{name}: cancelled")]
    Cancelled { name: String },

    #[error("{name}: teardown incomplete ({})", .failures.join("; "))]
    Teardown { name: String, failures: Vec<String> },

    #[error("{machine}: {step} failed")]
    Step {
        machine: String,
        step: &'static str,
        #[source]
        source: Box<MachinaError>,
    },
}

impl MachinaError {
    /// Wrap an error with the machine and lifecycle step it came from.
    pub fn in_step(self, machine: &str, step: &'static str) -> Self {
        MachinaError::Step {
            machine: machine.to_string(),
            step,
            source: Box::new(self),
        }
    }

    /// True for readiness timeouts, including ones wrapped in a step.
    pub fn is_timeout(&self) -> bool {
        match self {
            MachinaError::Timeout { .. } => true,
            MachinaError::Step { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MachinaError::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wrapper_names_machine_and_step() {
        let err = MachinaError::AlreadyExists {
            name: "web".into(),
        }
        .in_step("web", "create directory");
        assert_eq!(err.to_string(), "web: create directory failed");
    }

    #[test]
    fn timeout_detected_through_step() {
        let err = MachinaError::Timeout {
            name: "db".into(),
            address: "192.168.122.20:22".into(),
        }
        .in_step("db", "wait");
        assert!(err.is_timeout());
        assert!(!MachinaError::NotFound { name: "x".into() }.is_timeout());
    }

    #[test]
    fn teardown_lists_failures() {
        let err = MachinaError::Teardown {
            name: "db".into(),
            failures: vec!["virsh destroy: no domain".into(), "ssh-keygen: exit 1".into()],
        };
        assert_eq!(
            err.to_string(),
            "db: teardown incomplete (virsh destroy: no domain; ssh-keygen: exit 1)"
        );
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::driver::HypervisorKind;
use crate::error::MachinaError;
use crate::paths;

pub const DEFAULT_ENDPOINT: &str =
    "https://raw.githubusercontent.com/enkodr/machina/main/templates";
pub const DEFAULT_LISTING: &str =
    "https://api.github.com/repos/enkodr/machina/contents/templates";

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    pub hypervisor: String,
    pub connection: String,
    #[facet(default)]
    pub catalog: CatalogConfig,
    #[facet(default)]
    pub directories: DirectoriesConfig,
    #[facet(default)]
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        let (hypervisor, connection) = if cfg!(target_os = "macos") {
            ("qemu", "")
        } else {
            ("libvirt", "qemu:///system")
        };
        Self {
            hypervisor: hypervisor.into(),
            connection: connection.into(),
            catalog: CatalogConfig::default(),
            directories: DirectoriesConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct CatalogConfig {
    /// Base URL serving `<name>.yaml`.
    pub endpoint: String,
    /// Directory-listing API returning `[{name, type}]`.
    pub listing: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            listing: DEFAULT_LISTING.into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DirectoriesConfig {
    pub images: String,
    pub instances: String,
    pub clusters: String,
    pub results: String,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        let data = paths::data_dir();
        let sub = |name: &str| data.join(name).display().to_string();
        Self {
            images: sub("images"),
            instances: sub("instances"),
            clusters: sub("clusters"),
            results: sub("results"),
        }
    }
}

impl DirectoriesConfig {
    pub fn images(&self) -> PathBuf {
        PathBuf::from(&self.images)
    }

    pub fn instances(&self) -> PathBuf {
        PathBuf::from(&self.instances)
    }

    pub fn clusters(&self) -> PathBuf {
        PathBuf::from(&self.clusters)
    }

    pub fn results(&self) -> PathBuf {
        PathBuf::from(&self.results)
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProbeConfig {
    #[facet(default = 300)]
    pub timeout_s: u64,
    #[facet(default = 1)]
    pub interval_s: u64,
    #[facet(default = 22)]
    pub port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_s: 300,
            interval_s: 1,
            port: 22,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }
}

impl Config {
    /// Hypervisor selected by the `hypervisor` key. Validated on load.
    pub fn hypervisor_kind(&self) -> Result<HypervisorKind, MachinaError> {
        self.hypervisor.parse()
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), MachinaError> {
    config.hypervisor_kind()?;

    if config.probe.timeout_s == 0 {
        return Err(MachinaError::Validation {
            message: "probe.timeout_s must be at least 1".into(),
        });
    }
    if config.probe.interval_s == 0 {
        return Err(MachinaError::Validation {
            message: "probe.interval_s must be at least 1".into(),
        });
    }

    let dirs = &config.directories;
    for (key, value) in [
        ("images", &dirs.images),
        ("instances", &dirs.instances),
        ("clusters", &dirs.clusters),
        ("results", &dirs.results),
    ] {
        if value.is_empty() {
            return Err(MachinaError::Validation {
                message: format!("directories.{key} must not be empty"),
            });
        }
    }

    if config.catalog.endpoint.is_empty() {
        return Err(MachinaError::Validation {
            message: "catalog.endpoint must not be empty".into(),
        });
    }

    Ok(())
}

/// Check that `name` is usable as a single path segment.
pub fn validate_name(name: &str) -> Result<(), MachinaError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(MachinaError::Validation {
            message: format!("name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Parse and validate config text.
pub fn parse_config(contents: &str, origin: &Path) -> Result<Config, MachinaError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| MachinaError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the config at `path`, or defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<Config, MachinaError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            let config = Config::default();
            validate_config(&config)?;
            return Ok(config);
        }
        Err(source) => {
            return Err(MachinaError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };
    parse_config(&contents, path)
}

//! Template loading: local files or the remote catalog.

use std::path::{Path, PathBuf};

use facet::Facet;

use crate::config::CatalogConfig;
use crate::error::MachinaError;
use crate::fetch::HttpFetch;

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait TemplateSource {
    /// Raw template bytes for a path or catalog name.
    async fn load(&self, identifier: &str) -> Result<Vec<u8>, MachinaError>;
}

/// Where an identifier's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOrigin {
    Local(PathBuf),
    Remote(String),
}

impl TemplateOrigin {
    /// Local when `identifier` names an existing path, remote otherwise.
    pub fn select(identifier: &str) -> Self {
        let path = Path::new(identifier);
        if path.exists() {
            TemplateOrigin::Local(path.to_path_buf())
        } else {
            TemplateOrigin::Remote(identifier.to_string())
        }
    }
}

/// Name a template gets when it does not declare one: the file stem for
/// local paths, the catalog name otherwise.
pub fn derived_name(identifier: &str) -> String {
    match TemplateOrigin::select(identifier) {
        TemplateOrigin::Local(path) => path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(identifier)
            .to_string(),
        TemplateOrigin::Remote(name) => name,
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct ListingEntry {
    #[facet(default)]
    name: String,
    #[facet(default, rename = "type")]
    kind: String,
}

/// Catalog names from a directory-listing response: files only, with
/// everything from the first `.` dropped.
fn parse_listing(body: &str) -> Result<Vec<String>, String> {
    let entries: Vec<ListingEntry> = facet_json::from_str(body).map_err(|e| e.to_string())?;
    Ok(entries
        .into_iter()
        .filter(|e| e.kind == "file")
        .filter_map(|e| e.name.split('.').next().map(str::to_string))
        .filter(|n| !n.is_empty())
        .collect())
}

/// Local files plus the HTTP catalog.
pub struct TemplateStore<'a, F> {
    endpoint: String,
    listing: String,
    fetcher: &'a F,
}

impl<'a, F: HttpFetch> TemplateStore<'a, F> {
    pub fn new(catalog: &CatalogConfig, fetcher: &'a F) -> Self {
        Self {
            endpoint: catalog.endpoint.trim_end_matches('/').to_string(),
            listing: catalog.listing.clone(),
            fetcher,
        }
    }

    pub fn remote_url(&self, name: &str) -> String {
        format!("{}/{name}.yaml", self.endpoint)
    }

    /// Fetch `<endpoint>/<name>.yaml`.
    pub async fn fetch_remote(&self, name: &str) -> Result<Vec<u8>, MachinaError> {
        let url = self.remote_url(name);
        tracing::debug!(url = %url, "fetching template");
        self.fetcher.get(&url).await
    }

    /// Catalog template names. Any failure yields an empty list.
    pub async fn list_available(&self) -> Vec<String> {
        let body = match self.fetcher.get(&self.listing).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "template listing unavailable");
                return Vec::new();
            }
        };
        match parse_listing(&String::from_utf8_lossy(&body)) {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable template listing");
                Vec::new()
            }
        }
    }
}

impl<F: HttpFetch> TemplateSource for TemplateStore<'_, F> {
    async fn load(&self, identifier: &str) -> Result<Vec<u8>, MachinaError> {
        match TemplateOrigin::select(identifier) {
            TemplateOrigin::Local(path) => tokio::fs::read(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MachinaError::NotFound {
                        name: path.display().to_string(),
                    }
                } else {
                    MachinaError::io(format!("reading template {}", path.display()), e)
                }
            }),
            TemplateOrigin::Remote(name) => self.fetch_remote(&name).await,
        }
    }
}

// ── MemorySource ──────────────────────────────────────────

#[cfg(test)]
pub use memory::MemorySource;

#[cfg(test)]
mod memory {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::TemplateSource;
    use crate::error::MachinaError;

    /// Templates keyed by identifier, with a load log.
    #[derive(Default)]
    pub struct MemorySource {
        templates: BTreeMap<String, String>,
        loads: Mutex<Vec<String>>,
    }

    impl MemorySource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, identifier: &str, yaml: &str) -> Self {
            self.templates.insert(identifier.to_string(), yaml.to_string());
            self
        }

        pub fn loads(&self) -> Vec<String> {
            self.loads.lock().unwrap().clone()
        }
    }

    impl TemplateSource for MemorySource {
        async fn load(&self, identifier: &str) -> Result<Vec<u8>, MachinaError> {
            self.loads.lock().unwrap().push(identifier.to_string());
            self.templates
                .get(identifier)
                .map(|t| t.as_bytes().to_vec())
                .ok_or_else(|| MachinaError::Fetch {
                    url: identifier.into(),
                    message: "HTTP 404 Not Found".into(),
                })
        }
    }
}

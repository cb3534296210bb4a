use std::path::Path;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::MachinaError;

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait HttpFetch {
    /// GET `url` and return the body. Non-2xx is a `Fetch` error.
    async fn get(&self, url: &str) -> Result<Vec<u8>, MachinaError>;

    /// Stream `url` into `dest`, replacing any existing file.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), MachinaError>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    show_progress: bool,
}

impl HttpClient {
    pub fn new(show_progress: bool) -> Result<Self, MachinaError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("machina/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MachinaError::Fetch {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            show_progress,
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, MachinaError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MachinaError::Fetch {
                url: url.into(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(MachinaError::Fetch {
                url: url.into(),
                message: format!("HTTP {}", response.status()),
            });
        }
        Ok(response)
    }
}

/// Write a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    url: &str,
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), MachinaError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| MachinaError::io(format!("creating temp file {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MachinaError::Fetch {
            url: url.into(),
            message: format!("error reading response body: {e}"),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| MachinaError::io("writing image data", e))?;
        pb.inc(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| MachinaError::io("flushing image file", e))?;

    Ok(())
}

impl HttpFetch for HttpClient {
    async fn get(&self, url: &str) -> Result<Vec<u8>, MachinaError> {
        let response = self.send(url).await?;
        let bytes = response.bytes().await.map_err(|e| MachinaError::Fetch {
            url: url.into(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), MachinaError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MachinaError::io(format!("creating directory {}", parent.display()), e))?;
        }

        tracing::info!(url = %url, "downloading");
        let response = self.send(url).await?;
        let total_size = response.content_length().unwrap_or(0);

        let pb = ProgressBar::new(total_size);
        if self.show_progress {
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
        } else {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let tmp_path = dest.with_extension("part");
        let _ = tokio::fs::remove_file(&tmp_path).await;

        if let Err(e) = download_to_file(url, &tmp_path, response, &pb).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, dest).await.map_err(|e| {
            MachinaError::io(
                format!("renaming {} to {}", tmp_path.display(), dest.display()),
                e,
            )
        })?;

        pb.finish_and_clear();
        tracing::info!(path = %dest.display(), "download complete");
        Ok(())
    }
}

// ── StaticFetcher ─────────────────────────────────────────

#[cfg(test)]
pub use fake::StaticFetcher;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use ring::digest::{Algorithm, Context, Digest, SHA256, SHA512};

use crate::error::MachinaError;
use crate::fetch::HttpFetch;

/// Last path segment of an image URL.
pub fn filename_from_url(url: &str) -> Result<String, MachinaError> {
    let invalid = || MachinaError::Validation {
        message: format!("invalid image url '{url}'"),
    };
    if url.is_empty() {
        return Err(invalid());
    }
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() < 4 {
        return Err(invalid());
    }
    match parts.last() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(invalid()),
    }
}

fn algorithm(name: &str) -> Option<&'static Algorithm> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" => Some(&SHA256),
        "sha512" => Some(&SHA512),
        _ => None,
    }
}

fn file_digest(file: &mut File, algorithm: &'static Algorithm) -> std::io::Result<Digest> {
    let mut reader = BufReader::new(file);
    let mut context = Context::new(algorithm);
    let mut buffer = [0; 64 * 1024];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(context.finish())
}

/// True when `path` exists and hashes to `checksum` (`sha256:<hex>` or
/// `sha512:<hex>`). Unknown algorithms and unreadable files never match.
pub fn checksum_matches(path: &Path, checksum: &str) -> bool {
    let Some((algo, expected)) = checksum.split_once(':') else {
        return false;
    };
    let Some(algorithm) = algorithm(algo) else {
        tracing::warn!(algorithm = %algo, "unsupported checksum algorithm");
        return false;
    };
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    match file_digest(&mut file, algorithm) {
        Ok(digest) => hex::encode(digest.as_ref()).eq_ignore_ascii_case(expected.trim()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to hash image");
            false
        }
    }
}

/// Make sure the image for `url` sits in `images_dir` with the declared
/// checksum, downloading it otherwise. Returns the local path.
pub async fn ensure_image<F: HttpFetch>(
    url: &str,
    checksum: &str,
    images_dir: &Path,
    fetcher: &F,
) -> Result<PathBuf, MachinaError> {
    let filename = filename_from_url(url)?;
    let dest = images_dir.join(&filename);

    let (check_path, check_sum) = (dest.clone(), checksum.to_string());
    let matches = tokio::task::spawn_blocking(move || checksum_matches(&check_path, &check_sum))
        .await
        .unwrap_or(false);
    if matches {
        tracing::info!(path = %dest.display(), "image checksum matches, skipping download");
        return Ok(dest);
    }

    tokio::fs::create_dir_all(images_dir)
        .await
        .map_err(|e| MachinaError::io(format!("creating image dir {}", images_dir.display()), e))?;

    fetcher.download(url, &dest).await?;
    Ok(dest)
}

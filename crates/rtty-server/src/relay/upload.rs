//! Image uploads from browser clients.
//!
//! Pasted or dropped images are decoded and written, owner-only, into a
//! private per-process scratch directory so the terminal program can be
//! pointed at the resulting path.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Extensions an uploaded file may keep; anything else is stored as `.png`.
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "bmp"];

const MAX_STEM_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("image too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid base64 image data")]
    InvalidEncoding,

    #[error("failed to store image: {0}")]
    Io(#[from] std::io::Error),
}

/// Reduce a client-supplied name to `[A-Za-z0-9._-]` with an allowed extension.
pub fn sanitize_filename(name: Option<&str>) -> String {
    let base = name
        .unwrap_or("")
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");

    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
        None => (base, String::new()),
    };

    let mut clean: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    clean = clean.trim_start_matches('.').to_string();
    if clean.is_empty() {
        clean = "image".to_string();
    }

    let ext = if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        ext
    } else {
        "png".to_string()
    };

    format!("{clean}.{ext}")
}

/// Decode base64 (optionally a `data:` URL), enforcing `max_bytes`.
pub fn decode_image(data: &str, max_bytes: usize) -> Result<Vec<u8>, UploadError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, b64)| b64).unwrap_or(""),
        None => data,
    };
    let payload = payload.trim();

    // Reject before allocating when the encoded length already rules it out.
    let estimated = payload.len() / 4 * 3;
    if estimated > max_bytes + 3 {
        return Err(UploadError::TooLarge {
            size: estimated,
            max: max_bytes,
        });
    }

    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| UploadError::InvalidEncoding)?;
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    if bytes.is_empty() {
        return Err(UploadError::InvalidEncoding);
    }
    Ok(bytes)
}

/// Write `bytes` under `dir` with owner-only permissions.
pub fn save_image(dir: &Path, name: Option<&str>, bytes: &[u8]) -> Result<PathBuf, UploadError> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let nonce: u16 = rand::thread_rng().gen();
    let path = dir.join(format!("{stamp}-{nonce:04x}-{}", sanitize_filename(name)));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(bytes)?;
    file.flush()?;

    info!(path = %path.display(), bytes = bytes.len(), "image stored");
    Ok(path)
}

/// Create a fresh owner-only scratch directory under the system temp dir.
pub fn create_scratch_dir() -> std::io::Result<PathBuf> {
    let suffix: u64 = rand::thread_rng().gen();
    let dir = std::env::temp_dir().join(format!("rtty-{}-{suffix:016x}", std::process::id()));
    DirBuilder::new().mode(0o700).create(&dir)?;
    Ok(dir)
}

//! Snapshot capture: crop a detection out of its frame, upload it to object
//! storage and hand back a time-limited URL.
//!
//! Uploads are best-effort per detection. `SnapshotSink::capture` never
//! returns an error; it folds failures into `SnapshotRef::Failed` so the
//! PersonRecord is still written.

use anyhow::{anyhow, Result};
use image::RgbImage;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::{now_s, BBox, OccupancyError, OccupancyResult, SnapshotRef};

pub mod crop;
pub mod fs;
#[cfg(feature = "object-store-http")]
pub mod http;

pub use fs::FilesystemObjectStore;
#[cfg(feature = "object-store-http")]
pub use http::HttpObjectStore;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

pub trait ObjectStore: Send + Sync {
    fn put_object(&self, bucket: &str, path: &str, bytes: &[u8], content_type: &str)
        -> Result<()>;

    fn presigned_get_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String>;
}

/// `<location>/<area>/<32 hex chars>.jpg`. The random component keeps
/// concurrent captures in different zones from ever sharing a path.
pub fn object_path(location: &str, area_name: &str) -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    format!("{}/{}/{}.jpg", location, area_name, hex::encode(id))
}

/// Rejects empty, dot and dot-dot segments and anything outside
/// `[A-Za-z0-9_.-]`.
pub(crate) fn validate_object_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(anyhow!("object path cannot be empty"));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(anyhow!("object path `{}` has an invalid segment", path));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(anyhow!("object path `{}` must be [A-Za-z0-9_.-/] only", path));
        }
    }
    Ok(())
}

// -------------------- URL signing --------------------

/// Signs `<base_url>/<bucket>/<path>?expires=<epoch s>&signature=<hex>`,
/// where the signature is SHA-256 over `secret|bucket|path|expires`.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    secret: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("url signing secret cannot be empty"));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        let expires = now_s()?
            .checked_add(ttl.as_secs())
            .ok_or_else(|| anyhow!("url ttl {:?} overflows the expiry", ttl))?;
        Ok(self.sign_with_expiry(bucket, path, expires))
    }

    fn sign_with_expiry(&self, bucket: &str, path: &str, expires: u64) -> String {
        format!(
            "{}/{}/{}?expires={}&signature={}",
            self.base_url,
            bucket,
            path,
            expires,
            self.signature(bucket, path, expires)
        )
    }

    fn signature(&self, bucket: &str, path: &str, expires: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns `(bucket, path)` for a URL this signer produced that has not
    /// expired at `now_s`.
    pub fn verify(&self, url: &str, now_s: u64) -> Result<(String, String)> {
        let rest = url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| anyhow!("url is not under {}", self.base_url))?;
        let (object, query) = rest
            .split_once('?')
            .ok_or_else(|| anyhow!("url has no signature"))?;
        let (bucket, path) = object
            .split_once('/')
            .ok_or_else(|| anyhow!("url has no object path"))?;
        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = Some(v),
                Some(("signature", v)) => signature = Some(v),
                _ => {}
            }
        }
        let expires: u64 = expires
            .ok_or_else(|| anyhow!("url has no expiry"))?
            .parse()
            .map_err(|_| anyhow!("url expiry is not an integer"))?;
        let signature = signature.ok_or_else(|| anyhow!("url has no signature"))?;
        if !constant_time_eq(
            signature.as_bytes(),
            self.signature(bucket, path, expires).as_bytes(),
        ) {
            return Err(anyhow!("url signature invalid"));
        }
        if now_s > expires {
            return Err(anyhow!("url expired"));
        }
        Ok((bucket.to_string(), path.to_string()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// -------------------- Sink --------------------

#[derive(Clone)]
pub struct SnapshotSink {
    store: Arc<dyn ObjectStore>,
    url_ttl: Duration,
}

impl SnapshotSink {
    pub fn new(store: Arc<dyn ObjectStore>, url_ttl: Duration) -> Self {
        Self { store, url_ttl }
    }

    /// Puts the bytes and returns a presigned GET URL.
    pub fn upload(&self, bucket: &str, object_path: &str, bytes: &[u8]) -> OccupancyResult<String> {
        self.store
            .put_object(bucket, object_path, bytes, JPEG_CONTENT_TYPE)
            .map_err(OccupancyError::upstream)?;
        self.store
            .presigned_get_url(bucket, object_path, self.url_ttl)
            .map_err(OccupancyError::upstream)
    }

    /// Crops `bbox` out of `frame`, uploads it and reports the outcome.
    /// Without a frame nothing is attempted.
    pub fn capture(
        &self,
        bucket: &str,
        location: &str,
        area_name: &str,
        frame: Option<&RgbImage>,
        bbox: &BBox,
    ) -> SnapshotRef {
        let Some(frame) = frame else {
            return SnapshotRef::NotCaptured;
        };
        let object_path = object_path(location, area_name);
        let result = crop::crop_jpeg(frame, bbox)
            .map_err(|e| OccupancyError::invalid_input(format!("{:#}", e)))
            .and_then(|bytes| self.upload(bucket, &object_path, &bytes));
        match result {
            Ok(url) => SnapshotRef::Uploaded { url, object_path },
            Err(err) => {
                log::warn!("snapshot upload to {}/{} failed: {}", bucket, object_path, err);
                SnapshotRef::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

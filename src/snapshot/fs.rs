//! Object store backed by a local directory tree: `root/<bucket>/<path>`.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{validate_object_path, ObjectStore, UrlSigner};

pub struct FilesystemObjectStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str, signing_secret: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create snapshot root {}", root.display()))?;
        Ok(Self {
            root,
            signer: UrlSigner::new(base_url, signing_secret)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `bucket/path` lives on disk. Validates both.
    pub fn object_file(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        crate::validate_name("bucket", bucket)?;
        validate_object_path(path)?;
        let mut out = self.root.join(bucket);
        for segment in path.split('/') {
            out.push(segment);
        }
        Ok(out)
    }

    /// Checks a presigned URL and returns the file it points at.
    pub fn verify_presigned_url(&self, url: &str, now_s: u64) -> Result<PathBuf> {
        let (bucket, path) = self.signer.verify(url, now_s)?;
        self.object_file(&bucket, &path)
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn put_object(&self, bucket: &str, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let target = self.object_file(bucket, path)?;
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("object path has no parent directory"))?;
        fs::create_dir_all(parent)?;
        write_atomic(&target, bytes)
            .with_context(|| format!("write object {}/{}", bucket, path))
    }

    fn presigned_get_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        validate_object_path(path)?;
        self.signer.sign(bucket, path, ttl)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

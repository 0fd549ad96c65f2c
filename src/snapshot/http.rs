//! Remote object store reached with plain HTTP `PUT`s
//! (`<endpoint>/<bucket>/<path>`).

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::{validate_object_path, ObjectStore, UrlSigner};

pub struct HttpObjectStore {
    agent: ureq::Agent,
    endpoint: Url,
    signer: UrlSigner,
}

impl HttpObjectStore {
    /// `public_base_url` is what clients resolve presigned URLs against.
    pub fn new(
        endpoint: &str,
        public_base_url: &str,
        signing_secret: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("parse object store endpoint")?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported object store scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint,
            signer: UrlSigner::new(public_base_url, signing_secret)?,
        })
    }

    fn object_url(&self, bucket: &str, path: &str) -> Result<Url> {
        crate::validate_name("bucket", bucket)?;
        validate_object_path(path)?;
        let base = self.endpoint.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/{}/{}", base, bucket, path)).context("build object url")
    }
}

impl ObjectStore for HttpObjectStore {
    fn put_object(&self, bucket: &str, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let url = self.object_url(bucket, path)?;
        self.agent
            .put(url.as_str())
            .set("Content-Type", content_type)
            .send_bytes(bytes)
            .with_context(|| format!("put object {}/{}", bucket, path))?;
        Ok(())
    }

    fn presigned_get_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        validate_object_path(path)?;
        self.signer.sign(bucket, path, ttl)
    }
}

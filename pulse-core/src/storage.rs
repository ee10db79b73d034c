use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing;

use crate::config::StorageConfig;
use crate::error::{PulseError, PulseResult};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Signed-URL blob store client. The store is a black box reached over its
/// REST surface; Pulse only ever hands out time-bounded URLs.
#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUpload {
    pub signed_url: String,
    pub path: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct SignUploadResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SignDownloadResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

#[derive(Debug, Deserialize)]
struct BucketInfo {
    name: String,
}

impl StorageClient {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow!("Failed to build blob store client: {}", e))?;

        Ok(StorageClient {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    /// Signed upload URL, valid for 300 seconds, upsert disabled.
    pub async fn create_signed_upload_url(&self, path: &str) -> PulseResult<SignedUpload> {
        let url = format!(
            "{}/object/upload/sign/{}/{}",
            self.base_url, self.bucket, path
        );

        let resp = self.auth(self.http.post(&url)).send().await?;
        let resp = check_status(resp).await?;
        let body: SignUploadResponse = resp.json().await?;

        let token = token_from_signed_url(&body.url).ok_or_else(|| {
            PulseError::Dependency("blob store returned signed URL without token".to_string())
        })?;

        Ok(SignedUpload {
            signed_url: format!("{}{}", self.base_url, body.url),
            path: path.to_string(),
            token,
        })
    }

    pub async fn create_signed_download_url(
        &self,
        path: &str,
        ttl_secs: u64,
    ) -> PulseResult<String> {
        let url = format!("{}/object/sign/{}/{}", self.base_url, self.bucket, path);

        let resp = self
            .auth(self.http.post(&url))
            .json(&serde_json::json!({ "expiresIn": ttl_secs }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: SignDownloadResponse = resp.json().await?;

        Ok(format!("{}{}", self.base_url, body.signed_url))
    }

    pub async fn remove(&self, paths: &[String]) -> PulseResult<()> {
        let url = format!("{}/object/{}", self.base_url, self.bucket);

        let resp = self
            .auth(self.http.delete(&url))
            .json(&serde_json::json!({ "prefixes": paths }))
            .send()
            .await?;
        check_status(resp).await?;

        Ok(())
    }

    pub async fn list_buckets(&self) -> PulseResult<Vec<String>> {
        let url = format!("{}/bucket", self.base_url);

        let resp = self.auth(self.http.get(&url)).send().await?;
        let resp = check_status(resp).await?;
        let buckets: Vec<BucketInfo> = resp.json().await?;

        Ok(buckets.into_iter().map(|b| b.name).collect())
    }

    pub async fn create_bucket(&self, name: &str, file_size_limit: u64) -> PulseResult<()> {
        let url = format!("{}/bucket", self.base_url);

        let resp = self
            .auth(self.http.post(&url))
            .json(&serde_json::json!({
                "name": name,
                "public": false,
                "file_size_limit": file_size_limit,
            }))
            .send()
            .await?;
        check_status(resp).await?;

        Ok(())
    }

    /// Creates the media bucket on startup if it does not exist yet.
    pub async fn ensure_bucket(&self, file_size_limit: u64) -> PulseResult<()> {
        let buckets = self.list_buckets().await?;
        if buckets.iter().any(|b| b == &self.bucket) {
            tracing::debug!("Bucket {} already exists", self.bucket);
            return Ok(());
        }

        tracing::info!("Creating media bucket: {}", self.bucket);
        let bucket = self.bucket.clone();
        self.create_bucket(&bucket, file_size_limit).await
    }
}

async fn check_status(resp: reqwest::Response) -> PulseResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(PulseError::Dependency(format!(
        "blob store responded {}: {}",
        status, body
    )))
}

fn token_from_signed_url(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_from_signed_url() {
        let url = "/object/upload/sign/chat-media/conversations/c1/f.png?token=abc123";
        assert_eq!(token_from_signed_url(url), Some("abc123".to_string()));
    }

    #[test]
    fn extracts_token_among_other_params() {
        let url = "/object/upload/sign/b/p?expires=300&token=t0k&x=1";
        assert_eq!(token_from_signed_url(url), Some("t0k".to_string()));
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(token_from_signed_url("/object/sign/b/p"), None);
        assert_eq!(token_from_signed_url("/object/sign/b/p?expires=300"), None);
    }
}

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::ports::Uploader;

/// Uploads frames as block blobs with a plain HTTP PUT.
pub struct BlobUploader {
    client: reqwest::Client,
    endpoint: String,
    container: String,
    sas_token: Option<String>,
}

impl BlobUploader {
    pub fn new(
        endpoint: impl Into<String>,
        container: impl Into<String>,
        sas_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            container: container.into(),
            sas_token,
        })
    }

    fn container_path(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.container.trim_matches('/')
        )
    }

    fn with_query(&self, mut url: String, query: Option<&str>) -> String {
        let token = self
            .sas_token
            .as_deref()
            .map(|t| t.trim_start_matches('?'))
            .filter(|t| !t.is_empty());
        let params: Vec<&str> = query.into_iter().chain(token).collect();
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    /// `{endpoint}/{container}/{device}/{timestamp}.{ext}[?sas]`
    pub fn blob_url(&self, device_id: &str, timestamp: &str, extension: &str) -> String {
        let path = format!(
            "{}/{}/{}.{}",
            self.container_path(),
            device_id,
            timestamp,
            extension
        );
        self.with_query(path, None)
    }

    /// `{endpoint}/{container}?restype=container[&sas]`
    pub fn container_url(&self) -> String {
        self.with_query(self.container_path(), Some("restype=container"))
    }

    /// Create the container if it does not exist yet. An existing container
    /// (HTTP 409) counts as success.
    pub async fn ensure_container(&self) -> Result<(), UploadError> {
        let response = self
            .client
            .put(self.container_url())
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED => {
                info!(container = %self.container, "Created blob container");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(container = %self.container, "Blob container already exists");
                Ok(())
            }
            status => Err(UploadError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Uploader for BlobUploader {
    async fn upload(
        &self,
        payload: Vec<u8>,
        device_id: &str,
        timestamp: &str,
        extension: &str,
    ) -> Result<(), UploadError> {
        let url = self.blob_url(device_id, timestamp, extension);
        let response = self
            .client
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
            .body(payload)
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

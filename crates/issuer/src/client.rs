use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{IssuerError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    secret: &'a str,
    count: u32,
    max_downloads: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generated {
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub count: usize,
    pub max_downloads: u32,
}

#[derive(Debug, Deserialize)]
pub struct Uploaded {
    pub message: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Deserialize)]
pub struct ExhaustedEntry {
    pub token: String,
    pub exhausted_at: Option<String>,
    pub max: u32,
}

#[derive(Debug, Deserialize)]
pub struct ExhaustedReport {
    pub exhausted: Vec<ExhaustedEntry>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct TokenStatus {
    pub remaining: u32,
    pub max: u32,
    pub exhausted_at: Option<String>,
    pub message: String,
}

/// Client for the gateway's admin and status endpoints.
pub struct AdminClient {
    client: Client,
    base_url: String,
    secret: String,
}

impl AdminClient {
    pub fn new(base_url: &str, secret: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| IssuerError::Config(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn generate(&self, count: u32, max_downloads: u32) -> Result<Generated> {
        let body = GenerateRequest {
            secret: &self.secret,
            count,
            max_downloads,
        };
        let response = self
            .client
            .post(self.url("/api/admin/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| IssuerError::Http(format!("POST request failed: {}", e)))?;
        read_json(response).await
    }

    /// Streams the file from disk; it is never held in memory whole.
    pub async fn upload(&self, path: &Path) -> Result<Uploaded> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dropcode::ASSET_FILENAME.to_string());
        debug!("Uploading {} ({} bytes)", path.display(), len);

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len)
            .file_name(file_name)
            .mime_str(dropcode::ASSET_CONTENT_TYPE)
            .map_err(|e| IssuerError::Http(format!("Invalid content type: {}", e)))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("/api/admin/upload-album"))
            .header("x-admin-secret", &self.secret)
            .multipart(form)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS * 30))
            .send()
            .await
            .map_err(|e| IssuerError::Http(format!("Upload failed: {}", e)))?;
        read_json(response).await
    }

    pub async fn exhausted(&self) -> Result<ExhaustedReport> {
        let response = self
            .client
            .get(self.url("/api/admin/exhausted"))
            .query(&[("secret", self.secret.as_str())])
            .send()
            .await
            .map_err(|e| IssuerError::Http(format!("GET request failed: {}", e)))?;
        read_json(response).await
    }

    pub async fn status(&self, token: &str) -> Result<TokenStatus> {
        let response = self
            .client
            .get(self.url("/api/download"))
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| IssuerError::Http(format!("GET request failed: {}", e)))?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| IssuerError::Http(format!("Failed to read response: {}", e)))?;

    if !status.is_success() {
        return Err(IssuerError::Api {
            status: status.as_u16(),
            message: error_message(&text),
        });
    }
    Ok(serde_json::from_str(&text)?)
}

/// Pull `error` out of a gateway error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"success":false,"error":"Unauthorized"}"#),
            "Unauthorized"
        );
        assert_eq!(error_message("  Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = AdminClient::new("https://album.example.cz/", "s").unwrap();
        assert_eq!(
            client.url("/api/admin/generate"),
            "https://album.example.cz/api/admin/generate"
        );
    }

    #[test]
    fn test_generated_parses_gateway_body() {
        let body = r#"{"tokens":["a","b"],"urls":["u/a","u/b"],"count":2,"maxDownloads":3}"#;
        let generated: Generated = serde_json::from_str(body).unwrap();
        assert_eq!(generated.count, 2);
        assert_eq!(generated.max_downloads, 3);
        assert_eq!(generated.urls, vec!["u/a", "u/b"]);
    }
}

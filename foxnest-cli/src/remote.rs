//! HTTP transport for the sync protocol.
//!
//! Every request is one `POST {origin}/api/repository/{id}/sync` carrying a
//! framed [`SyncMessage`]; the answer is a framed response.

use std::time::Duration;

use foxnest_core::{FoxError, Remote, SyncMessage, SyncRequest, SyncResponse};

/// Remote server reached over HTTP
pub struct HttpRemote {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpRemote {
    /// Create a client for `base_url` (e.g. `http://server:5000`).
    pub fn new(base_url: &str) -> foxnest_core::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| FoxError::Connectivity(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sync_url(&self, repo_id: &str) -> String {
        format!("{}/api/repository/{}/sync", self.base_url, repo_id)
    }
}

impl Remote for HttpRemote {
    fn exchange(&self, request: SyncRequest) -> foxnest_core::Result<SyncResponse> {
        let url = self.sync_url(&request.repository_id);
        let frame = SyncMessage::Request(request).encode()?;
        tracing::debug!("POST {} ({} bytes)", url, frame.len());

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-foxnest-sync")
            .body(frame)
            .send()
            .map_err(|e| FoxError::Connectivity(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            let message = format!("POST {} failed ({}): {}", url, status, body);
            return Err(if status.is_server_error() {
                FoxError::Connectivity(message)
            } else {
                FoxError::Protocol(message)
            });
        }

        let body = resp
            .bytes()
            .map_err(|e| FoxError::Connectivity(format!("{}: {}", url, e)))?;
        SyncMessage::decode(&body)?.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_url() {
        let remote = HttpRemote::new("http://localhost:5000/").unwrap();
        assert_eq!(remote.base_url(), "http://localhost:5000");
        assert_eq!(
            remote.sync_url("abc123"),
            "http://localhost:5000/api/repository/abc123/sync"
        );
    }

    #[test]
    fn test_unreachable_server_is_connectivity_error() {
        // Nothing listens on the discard port.
        let remote = HttpRemote::new("http://127.0.0.1:9").unwrap();
        let err = remote.exchange(SyncRequest::info("abc")).unwrap_err();
        assert!(matches!(err, FoxError::Connectivity(_)), "got {err}");
        assert!(err.is_retryable());
    }
}

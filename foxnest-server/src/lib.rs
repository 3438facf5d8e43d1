//! FoxNest HTTP front end
//!
//! Serves many hosted repositories over a small JSON + binary API:
//! framed sync messages for push/pull and JSON for inspection and archive
//! administration.

pub mod handlers;

pub use handlers::handle_api_request;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use foxnest_core::{HostConfig, RepositoryHost};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, Request, Response};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub addr: String,
    /// Repositories live under `<root>/repositories`
    pub root: PathBuf,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Enable debug logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: format!("0.0.0.0:{}", foxnest_core::config::DEFAULT_PORT),
            root: PathBuf::from("./data"),
            max_body_size: 256 * 1024 * 1024, // 256 MB
            debug: false,
        }
    }
}

/// Request handler shared by every connection
pub struct ApiHandler {
    config: Config,
    host: Arc<RepositoryHost>,
}

impl ApiHandler {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let host = RepositoryHost::new(HostConfig::new(config.root.clone()))
            .map_err(|e| ServerError::Internal(format!("cannot open {}: {}", config.root.display(), e)))?;
        Ok(Self {
            config,
            host: Arc::new(host),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &Arc<RepositoryHost> {
        &self.host
    }

    /// Read the body (bounded by `max_body_size`) and route the request
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, ServerError> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        tracing::debug!("API request: {} {}", method, path);

        let body = match Limited::new(req.into_body(), self.config.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(ServerError::PayloadTooLarge(self.config.max_body_size));
            }
            Err(e) => return Err(ServerError::Http(e.to_string())),
        };

        Ok(handle_api_request(method.as_str(), &path, &body, &self.host).await)
    }
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> u16 {
        match self {
            ServerError::Http(_) => 400,
            ServerError::PayloadTooLarge(_) => 413,
            ServerError::Internal(_) => 500,
        }
    }
}

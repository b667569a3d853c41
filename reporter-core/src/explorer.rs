//! Explorer client
//!
//! The explorer exposes blocks by height over HTTP. A height that has not
//! been produced yet is answered with `400 no block found ...`; that case
//! is surfaced as [`Error::NotYetProduced`] so the scanner can back off
//! without looking at message text.

use crate::{config::ExplorerConfig, types::Block, Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

/// Endpoint prefix for block lookups
pub const BLOCK_ENDPOINT: &str = "explorer/blocks";

/// Message prefix the explorer uses for heights past the chain tip
pub const NO_BLOCK_FOUND: &str = "no block found";

/// Source of blocks by height
#[async_trait]
pub trait ExplorerClient: Send + Sync {
    /// Fetch the block at `height`
    async fn get_block(&self, height: u64) -> Result<Block>;
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    block: Block,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: String,
}

/// HTTP explorer client
#[derive(Debug, Clone)]
pub struct HttpExplorer {
    base: Url,
    user_agent: String,
    client: Client,
}

impl HttpExplorer {
    /// Create client from configuration. Only `http` and `https` URLs are accepted.
    pub fn new(config: &ExplorerConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid explorer url '{}': {}", config.url, e)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(Error::Config(format!(
                "Invalid explorer url scheme '{}'",
                base.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            base,
            user_agent: config.user_agent.clone(),
            client,
        })
    }

    fn block_url(&self, height: u64) -> String {
        format!(
            "{}/{}/{}",
            self.base.as_str().trim_end_matches('/'),
            BLOCK_ENDPOINT,
            height
        )
    }

    async fn error_from_response(height: u64, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Error::Http(e),
        };

        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => parsed.message,
            Err(e) => {
                return Error::Explorer {
                    status: status.as_u16(),
                    message: format!("failed to parse error message '{}': {}", body, e),
                }
            }
        };

        if status == StatusCode::BAD_REQUEST && message.starts_with(NO_BLOCK_FOUND) {
            return Error::NotYetProduced { height, message };
        }

        Error::Explorer {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl ExplorerClient for HttpExplorer {
    async fn get_block(&self, height: u64) -> Result<Block> {
        let response = self
            .client
            .get(self.block_url(height))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Self::error_from_response(height, response).await);
        }

        let body = response.bytes().await?;
        let decoded: BlockResponse = serde_json::from_slice(&body)?;

        tracing::trace!(height = decoded.block.height, "Block fetched");
        Ok(decoded.block)
    }
}

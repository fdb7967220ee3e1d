//! HTTP push publisher. Publisher-only.

use async_trait::async_trait;
use githook_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::HttpConfig;
use crate::Publisher;

/// Header prefix metadata keys are mapped onto.
const META_HEADER_PREFIX: &str = "x-githook-";

/// POSTs each message to a configured endpoint.
#[derive(Debug)]
pub struct HttpPublisher {
    config: HttpConfig,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl HttpPublisher {
    /// Build the publisher; connections are made per request.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("http publisher"));
        }
        let mut request = self
            .http
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(format!("{META_HEADER_PREFIX}topic"), topic)
            .body(payload.to_vec());
        for (key, value) in metadata {
            request = request.header(format!("{META_HEADER_PREFIX}{key}"), value);
        }

        let response = request.send().await.map_err(Error::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "http sink returned {status} for topic {topic}"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

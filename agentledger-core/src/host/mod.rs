//! HTTP client for the host runtime's API
//!
//! The reconciler and backfill run on plain threads, so the client exposes a
//! blocking surface backed by a current-thread tokio runtime wrapping the
//! async reqwest calls.
//!
//! Endpoints used:
//! - `GET /session` — all sessions
//! - `GET /session/{id}/message` — a session's messages with parts,
//!   creation-ordered
//! - `GET /session/{id}/message/{messageID}` — one message with parts
//! - `GET /event` — server-sent event stream of live events

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::types::{LedgerEvent, MessageWithParts, SessionInfo};

/// Read access to the host runtime. Mocked in tests.
pub trait HostClient {
    /// All sessions known to the host.
    fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    /// A session's messages with their parts, in creation order.
    fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>>;

    /// One message with its parts.
    fn message_detail(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts>;
}

impl<H: HostClient + ?Sized> HostClient for &H {
    fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        (**self).list_sessions()
    }

    fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>> {
        (**self).session_messages(session_id)
    }

    fn message_detail(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts> {
        (**self).message_detail(session_id, message_id)
    }
}

/// HTTP implementation of [`HostClient`].
pub struct HttpHostClient {
    base_url: String,
    http: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpHostClient {
    /// Create a client from configuration.
    pub fn new(config: &HostConfig) -> Result<Self> {
        let base_url = config.resolved_base_url().trim_end_matches('/').to_string();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Host(format!("failed to build tokio runtime: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Host(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http,
            runtime,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        self.runtime.block_on(async {
            let response = self.http.get(&url).send().await?;
            let status = response.status();

            if status.is_success() {
                Ok(response.json::<T>().await?)
            } else {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(Error::Host(format!("API error ({}): {}", status, body)))
            }
        })
    }
}

impl HostClient for HttpHostClient {
    fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.get_json("/session")
    }

    fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>> {
        self.get_json(&format!("/session/{}/message", session_id))
    }

    fn message_detail(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts> {
        self.get_json(&format!("/session/{}/message/{}", session_id, message_id))
    }
}

/// Incremental SSE frame decoder.
///
/// The host frames one JSON event per `data:` line; multi-line data is
/// accumulated until the blank separator per the SSE wire format. Comment
/// lines (`:keepalive`) and non-data fields are ignored.
#[derive(Debug, Default)]
struct SseDecoder {
    /// Raw bytes not yet split into lines (chunks can split mid-line and
    /// mid-codepoint)
    buffer: Vec<u8>,
    /// `data:` payload of the event currently being assembled
    data: String,
}

impl SseDecoder {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete data frame, if one is fully buffered.
    fn next_frame(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Event boundary
                if !self.data.is_empty() {
                    return Some(std::mem::take(&mut self.data));
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
        }
        None
    }
}

/// Blocking reader over the host's `GET /event` SSE stream.
///
/// Events whose JSON fails to parse are logged and skipped so one malformed
/// frame never kills the stream.
pub struct EventSource {
    response: reqwest::Response,
    runtime: tokio::runtime::Runtime,
    decoder: SseDecoder,
}

impl EventSource {
    /// Connect to the host's event stream.
    pub fn connect(config: &HostConfig) -> Result<Self> {
        let base_url = config.resolved_base_url().trim_end_matches('/').to_string();
        let url = format!("{}/event", base_url);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Host(format!("failed to build tokio runtime: {e}")))?;

        // The stream stays open indefinitely, so no overall request timeout
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Host(format!("failed to build HTTP client: {e}")))?;

        let response = runtime.block_on(async {
            let response = http.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Host(format!(
                    "event stream refused ({}): {}",
                    status, url
                )));
            }
            Ok(response)
        })?;

        tracing::info!(url = %url, "Connected to host event stream");

        Ok(Self {
            response,
            runtime,
            decoder: SseDecoder::default(),
        })
    }

    /// Next event from the stream. `Ok(None)` means the host closed it.
    pub fn next_event(&mut self) -> Result<Option<LedgerEvent>> {
        loop {
            while let Some(payload) = self.decoder.next_frame() {
                match serde_json::from_str::<LedgerEvent>(&payload) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed event frame");
                    }
                }
            }

            // Need more bytes
            let chunk = self
                .runtime
                .block_on(self.response.chunk())
                .map_err(Error::Http)?;

            match chunk {
                Some(bytes) => self.decoder.push_bytes(&bytes),
                None => return Ok(None),
            }
        }
    }
}

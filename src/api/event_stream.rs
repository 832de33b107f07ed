//! Reader for the newline-delimited JSON event stream.
//!
//! Each line is a record `{"result": {"id": ..., "message": {...}}, "error": ...}`.
//! The reader tracks the highest observed message id and resumes from it
//! across reconnects. Unknown event variants drop silently; malformed lines
//! advance past the line without invoking the callback. The consecutive
//! error counter resets on every successfully read line, whether or not the
//! line parsed.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutorError, Result};
use crate::reporter::event::EventMessage;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff between reconnect attempts doubles up to this cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(default)]
    result: Option<RawResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    id: String,
    #[serde(default)]
    message: serde_json::Value,
}

/// Opens one long-poll connection to the event stream. Implemented over HTTP
/// in production and over canned lines in tests.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        queue: &str,
        job_set_id: &str,
        from_message_id: Option<&str>,
        watch: bool,
    ) -> Result<BoxStream<'static, std::io::Result<String>>>;
}

#[async_trait]
impl StreamConnector for std::sync::Arc<dyn StreamConnector> {
    async fn connect(
        &self,
        queue: &str,
        job_set_id: &str,
        from_message_id: Option<&str>,
        watch: bool,
    ) -> Result<BoxStream<'static, std::io::Result<String>>> {
        (**self)
            .connect(queue, job_set_id, from_message_id, watch)
            .await
    }
}

pub struct HttpStreamConnector {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpStreamConnector {
    pub fn new(base_url: &str, auth_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
        }
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn connect(
        &self,
        queue: &str,
        job_set_id: &str,
        from_message_id: Option<&str>,
        watch: bool,
    ) -> Result<BoxStream<'static, std::io::Result<String>>> {
        let url = format!("{}/v1/job-set/{}/{}", self.base_url, queue, job_set_id);

        let mut request = self.client.get(url).query(&[
            ("from_message_id", from_message_id.unwrap_or_default()),
            ("watch", if watch { "true" } else { "false" }),
        ]);
        if !self.auth_token.is_empty() {
            request = request.bearer_auth(&self.auth_token);
        }

        let response = request.send().await?.error_for_status()?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let lines = StreamReader::new(bytes).lines();

        Ok(futures::stream::unfold(lines, |mut lines| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), lines)),
                Ok(None) => None,
                Err(e) => Some((Err(e), lines)),
            }
        })
        .boxed())
    }
}

/// Long-poll consumer over a [`StreamConnector`].
///
/// In bounded mode (`watch = false`) a clean end of stream completes the
/// call, and more than `consecutive_error_tolerance` consecutive transport
/// failures surface as an error. In watch mode both cases reconnect forever,
/// resuming from the highest observed message id.
pub struct EventStreamReader<C> {
    connector: C,
    consecutive_error_tolerance: u32,
}

impl<C: StreamConnector> EventStreamReader<C> {
    pub fn new(connector: C, consecutive_error_tolerance: u32) -> Self {
        Self {
            connector,
            consecutive_error_tolerance,
        }
    }

    /// Consume the stream, invoking `on_event` for every record that carries
    /// a known event variant. Returns the final cursor.
    pub async fn run<F>(
        &self,
        queue: &str,
        job_set_id: &str,
        from_message_id: Option<String>,
        watch: bool,
        shutdown: &CancellationToken,
        mut on_event: F,
    ) -> Result<Option<String>>
    where
        F: FnMut(&str, EventMessage) + Send,
    {
        let mut cursor = from_message_id;
        let mut consecutive_errors: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(cursor);
            }

            let connected = self
                .connector
                .connect(queue, job_set_id, cursor.as_deref(), watch)
                .await;

            let mut failed = false;
            match connected {
                Ok(mut lines) => loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(cursor),
                        next = lines.next() => next,
                    };
                    match next {
                        Some(Ok(line)) => {
                            consecutive_errors = 0;
                            Self::process_line(&line, &mut cursor, &mut on_event);
                        }
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "Event stream read failed");
                            failed = true;
                            break;
                        }
                        None => {
                            if !watch {
                                return Ok(cursor);
                            }
                            // Server closed an exhausted long poll; reconnect
                            // from the cursor.
                            break;
                        }
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "Event stream connect failed");
                    failed = true;
                }
            }

            if failed {
                consecutive_errors += 1;
                if !watch && consecutive_errors > self.consecutive_error_tolerance {
                    return Err(ExecutorError::EventStream(format!(
                        "{} consecutive failures reading job set {}",
                        consecutive_errors, job_set_id
                    )));
                }
            }

            let backoff = Self::backoff(consecutive_errors);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(cursor),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn process_line<F>(line: &str, cursor: &mut Option<String>, on_event: &mut F)
    where
        F: FnMut(&str, EventMessage),
    {
        if line.trim().is_empty() {
            return;
        }
        let record: StreamRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => return,
        };
        if let Some(error) = record.error {
            if !error.is_empty() {
                tracing::debug!(error = %error, "Event stream carried an error record");
            }
        }
        if let Some(result) = record.result {
            *cursor = Some(result.id.clone());
            if let Ok(event) = serde_json::from_value::<EventMessage>(result.message) {
                on_event(&result.id, event);
            }
        }
    }

    fn backoff(consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return INITIAL_BACKOFF;
        }
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        (INITIAL_BACKOFF * 2u32.pow(exponent)).min(MAX_BACKOFF)
    }
}

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::tools::{ToolRegistry, ToolResult, has_begin_marker};

/// UI-facing output of a streamed response.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
    /// End-of-stream signal; emitted exactly once per response, including on
    /// cancellation, so the UI can leave its "thinking" state.
    async fn done(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct StreamOutcome {
    /// Everything the model produced, including any tool-call block.
    pub response: String,
    /// What actually reached the UI.
    pub forwarded: String,
    /// Whether a tool call was detected and output suppressed from then on.
    pub suppressed: bool,
    pub cancelled: bool,
    /// The fire-and-forget execution of the detected tool call, if any.
    /// Whoever consumes the result is responsible for echoing its envelope
    /// back into conversation history.
    pub tool_task: Option<JoinHandle<ToolResult>>,
}

/// Consumes a streamed chat completion, forwarding conversational text to
/// the UI at word boundaries and intercepting at most one embedded tool-call
/// block per response.
pub struct StreamInterceptor {
    registry: Arc<ToolRegistry>,
}

impl StreamInterceptor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn consume<S>(
        &self,
        mut stream: S,
        sink: Arc<dyn ChunkSink>,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        let response_id = uuid::Uuid::new_v4();
        let mut buffer = String::new();
        let mut flushed = 0usize;
        let mut forwarded = String::new();
        let mut suppressed = false;
        let mut cancelled = false;
        let mut tool_task: Option<JoinHandle<ToolResult>> = None;

        loop {
            let chunk = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = rx => {
                        cancelled = true;
                        break;
                    }
                    chunk = stream.next() => chunk,
                },
                None => stream.next().await,
            };
            let Some(chunk) = chunk else { break };
            buffer.push_str(&chunk);

            // Once suppressed, keep reading to drain the connection but
            // discard everything from the UI's point of view. Only the first
            // tool call in a response is ever honored.
            if suppressed {
                continue;
            }

            if let Some(call) = self.registry.detect(&buffer) {
                suppressed = true;
                tracing::info!(response = %response_id, tool = %call.name, syntax = ?call.syntax, "Tool call detected in stream");
                let registry = self.registry.clone();
                tool_task = Some(tokio::spawn(
                    async move { registry.execute(call).await },
                ));
                continue;
            }

            // A partially-streamed block must not leak to the UI; hold all
            // flushing once the buffer looks like the start of one.
            if has_begin_marker(&buffer) {
                continue;
            }

            // Flush words only once a following whitespace confirms they are
            // complete, so a streamed token is never split mid-word on screen.
            if let Some(end) = last_whitespace_end(&buffer[flushed..]) {
                let text = buffer[flushed..flushed + end].to_string();
                sink.send(&text).await?;
                forwarded.push_str(&text);
                flushed += end;
            }
        }

        // Residual unflushed tail goes out once at end-of-stream.
        if !suppressed && !cancelled && flushed < buffer.len() {
            let text = buffer[flushed..].to_string();
            sink.send(&text).await?;
            forwarded.push_str(&text);
        }

        sink.done().await?;
        tracing::debug!(
            response = %response_id,
            chars = buffer.len(),
            suppressed,
            cancelled,
            "Stream consumed"
        );

        Ok(StreamOutcome {
            response: buffer,
            forwarded,
            suppressed,
            cancelled,
            tool_task,
        })
    }
}

/// Byte offset just past the last whitespace char, or None if there is none.
fn last_whitespace_end(text: &str) -> Option<usize> {
    text.char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
}

//! SSE stream bridging: buffer an upstream chunk stream into a canonical
//! completion, and replay a canonical completion back out as SSE.
//!
//! Buffer-up and replay are inverses for any completion with non-empty
//! content and a terminal finish: `buffer(replay(c, 0)) == c`.

use std::{io, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::api_types::{
    AssistantMessage, ChatChoice, ChatCompletion, ChatCompletionChunk, ChunkChoice, ChunkDelta,
    FinishReason, Usage,
};

/// Maximum characters per replayed `delta.content` event.
const REPLAY_CHUNK_CHARS: usize = 48;

/// Incremental accumulator over a `chat.completion.chunk` SSE stream.
///
/// Feed it raw bytes as they arrive; it handles partial lines across chunk
/// boundaries, keep-alive comments, and the `data: [DONE]` terminator.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buf: String,
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    role: Option<String>,
    content: String,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    done: bool,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of raw SSE bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return;
        };
        self.buf.push_str(text);

        // Process complete lines; keep any trailing partial line buffered.
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            self.push_line(line.trim_end_matches(['\r', '\n']));
        }
    }

    fn push_line(&mut self, line: &str) {
        // SSE comments (keep-alives) start with ':'; blank lines separate events.
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            // Tolerate unrecognized events between chunks.
            return;
        };
        self.push_chunk(&chunk);
    }

    /// Fold one parsed chunk into the accumulated state.
    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) {
        self.id.get_or_insert_with(|| chunk.id.clone());
        self.model.get_or_insert_with(|| chunk.model.clone());
        self.created.get_or_insert(chunk.created);
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        if let Some(choice) = chunk.choices.first() {
            if let Some(role) = &choice.delta.role {
                self.role.get_or_insert_with(|| role.clone());
            }
            if let Some(content) = &choice.delta.content {
                self.content.push_str(content);
            }
            if let Some(finish) = choice.finish_reason {
                self.finish_reason = Some(finish);
            }
        }
    }

    /// Whether a terminator (`finish_reason` or `[DONE]`) has been observed.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Build the canonical completion, or `None` when the stream never
    /// reached a terminal finish.
    pub fn finish(self) -> Option<ChatCompletion> {
        let finish_reason = self.finish_reason?;
        Some(ChatCompletion {
            id: self.id.unwrap_or_default(),
            object: "chat.completion".to_string(),
            created: self.created.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: self.role.unwrap_or_else(|| "assistant".to_string()),
                    content: if self.content.is_empty() {
                        None
                    } else {
                        Some(self.content)
                    },
                    tool_calls: None,
                },
                finish_reason: Some(finish_reason),
            }],
            usage: self.usage,
        })
    }
}

/// Drain an SSE byte stream into a canonical completion.
///
/// Returns `None` when the stream errors out or ends without a terminal
/// finish; partial output is never promoted to a completion.
pub async fn buffer_stream<S, E>(mut stream: S) -> Option<ChatCompletion>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut acc = SseAccumulator::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => acc.push_bytes(&bytes),
            Err(_) => return None,
        }
    }
    acc.finish()
}

fn sse_frame(chunk: &ChatCompletionChunk) -> Bytes {
    let json = serde_json::to_string(chunk).unwrap_or_default();
    Bytes::from(format!("data: {}\n\n", json))
}

/// The `data: [DONE]` terminator frame.
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Split content on char boundaries into pieces of at most
/// [`REPLAY_CHUNK_CHARS`] characters.
fn split_content(content: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for (count, c) in content.chars().enumerate() {
        if count > 0 && count % REPLAY_CHUNK_CHARS == 0 {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Build the synthetic SSE frames for a cached completion: one role chunk,
/// content in ≤48-character deltas, one finish chunk (carrying usage when
/// present), and the `[DONE]` terminator.
pub fn build_replay_frames(completion: &ChatCompletion) -> Vec<Bytes> {
    let choice = completion.choices.first();
    let role = choice
        .map(|c| c.message.role.clone())
        .unwrap_or_else(|| "assistant".to_string());
    let content = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice.and_then(|c| c.finish_reason);

    let chunk = |delta: ChunkDelta, finish: Option<FinishReason>, usage: Option<Usage>| {
        ChatCompletionChunk {
            id: completion.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: completion.created,
            model: completion.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage,
        }
    };

    let mut frames = Vec::new();
    frames.push(sse_frame(&chunk(
        ChunkDelta {
            role: Some(role),
            content: None,
        },
        None,
        None,
    )));
    for piece in split_content(&content) {
        frames.push(sse_frame(&chunk(
            ChunkDelta {
                role: None,
                content: Some(piece),
            },
            None,
            None,
        )));
    }
    frames.push(sse_frame(&chunk(
        ChunkDelta::default(),
        finish_reason,
        completion.usage.clone(),
    )));
    frames.push(done_frame());
    frames
}

/// Error returned when a streaming response exceeds a deadline.
#[derive(Debug, thiserror::Error)]
pub enum StreamDeadlineError {
    #[error("streaming idle timeout: no chunk within {0:?}")]
    Idle(Duration),

    #[error("streaming total deadline exceeded after {0:?}")]
    Total(Duration),
}

/// A stream wrapper enforcing an idle timeout between chunks and a total
/// deadline for the whole stream.
///
/// The idle timer resets after each chunk, so long streams that keep
/// producing never trip it; the total deadline bounds even healthy streams.
/// On either timeout the stream yields a `TimedOut` error and terminates,
/// protecting the connection pool from stalled providers.
pub struct DeadlineStream<S> {
    inner: S,
    idle_timeout: Duration,
    total_timeout: Duration,
    idle: std::pin::Pin<Box<tokio::time::Sleep>>,
    total: std::pin::Pin<Box<tokio::time::Sleep>>,
    terminated: bool,
}

impl<S> DeadlineStream<S>
where
    S: Stream + Unpin,
{
    pub fn new(inner: S, idle_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            total_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            total: Box::pin(tokio::time::sleep(total_timeout)),
            terminated: false,
        }
    }
}

impl<S, T> Stream for DeadlineStream<S>
where
    S: Stream<Item = Result<T, io::Error>> + Unpin,
{
    type Item = Result<T, io::Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if self.terminated {
            return Poll::Ready(None);
        }

        match std::pin::Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                let next_idle = tokio::time::Instant::now() + self.idle_timeout;
                self.idle.as_mut().reset(next_idle);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.total.as_mut().poll(cx).is_ready() {
                    self.terminated = true;
                    tracing::warn!(
                        total_secs = self.total_timeout.as_secs(),
                        "streaming response exceeded total deadline"
                    );
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        StreamDeadlineError::Total(self.total_timeout),
                    ))));
                }
                if self.idle.as_mut().poll(cx).is_ready() {
                    self.terminated = true;
                    tracing::warn!(
                        idle_secs = self.idle_timeout.as_secs(),
                        "streaming response idle timeout; terminating stalled stream"
                    );
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        StreamDeadlineError::Idle(self.idle_timeout),
                    ))));
                }
                Poll::Pending
            }
        }
    }
}

/// Replay a cached completion as SSE, yielding for `delay` between frames so
/// clients observe a streaming shape.
pub fn replay_as_stream(
    completion: &ChatCompletion,
    delay: Duration,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + Unpin + use<> {
    let frames = build_replay_frames(completion);
    Box::pin(futures_util::stream::unfold(
        (frames.into_iter(), delay, true),
        |(mut frames, delay, first)| async move {
            let frame = frames.next()?;
            if !first && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(frame), (frames, delay, false)))
        },
    ))
}

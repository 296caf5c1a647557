//! Streaming output: a lazy chunk iterator and an async channel bridge.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Session, StreamChunk};
use crate::engine::{InferenceBackend, SessionError};

/// Pulls one chunk per call from a session.
///
/// Steps that release nothing are skipped, except the final one which
/// always yields the summary chunk. Cancellation is checked before every
/// step. Dropping an unfinished stream cancels the request.
pub struct CompletionStream<'a, B: InferenceBackend> {
    session: &'a mut Session<B>,
    cancel: CancellationToken,
    done: bool,
}

impl<'a, B: InferenceBackend> CompletionStream<'a, B> {
    pub(crate) fn new(session: &'a mut Session<B>, cancel: CancellationToken) -> Self {
        Self {
            session,
            cancel,
            done: false,
        }
    }
}

impl<B: InferenceBackend> Iterator for CompletionStream<'_, B> {
    type Item = Result<StreamChunk, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.cancel.is_cancelled() {
                self.session.cancel();
                self.done = true;
                return None;
            }
            match self.session.step() {
                Ok(step) if step.withheld => continue,
                Ok(step) if !step.is_final && step.content.is_empty() => continue,
                Ok(step) => {
                    self.done = step.is_final;
                    return Some(Ok(self.session.chunk(&step)));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<B: InferenceBackend> Drop for CompletionStream<'_, B> {
    fn drop(&mut self) {
        if !self.done {
            self.session.cancel();
        }
    }
}

/// Receiving half of [`spawn_stream`].
pub struct ChunkStream {
    receiver: mpsc::Receiver<Result<StreamChunk, SessionError>>,
}

impl ChunkStream {
    /// Receive the next chunk, if available.
    pub async fn recv(&mut self) -> Option<Result<StreamChunk, SessionError>> {
        self.receiver.recv().await
    }

    /// Concatenate all remaining chunk contents.
    pub async fn collect_text(mut self) -> Result<String, SessionError> {
        let mut text = String::new();
        while let Some(chunk) = self.recv().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
            if chunk.is_final() {
                break;
            }
        }
        Ok(text)
    }
}

impl futures::Stream for ChunkStream {
    type Item = Result<StreamChunk, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Run the current request of `session` on a blocking worker and stream its
/// chunks through a bounded channel.
///
/// The session comes back through the join handle once the request ends.
/// A dropped [`ChunkStream`] cancels the request after the step in flight.
pub fn spawn_stream<B>(
    mut session: Session<B>,
    buffer: usize,
    cancel: CancellationToken,
) -> (JoinHandle<Session<B>>, ChunkStream)
where
    B: InferenceBackend + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        for item in session.stream(cancel) {
            if sender.blocking_send(item).is_err() {
                tracing::warn!("stream consumer disconnected");
                break;
            }
        }
        session
    });
    (handle, ChunkStream { receiver })
}

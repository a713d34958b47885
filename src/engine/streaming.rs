//! Response streaming for incremental translations.
//!
//! A worker owns the [`ResponseSender`]; the caller owns the
//! [`ResponseStream`]. Exactly one terminal response is delivered per
//! stream, after which the channel closes. The terminal operations consume
//! the sender so a second terminal send cannot be written.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::Span;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;
use super::output::{Response, StreamMode};
use crate::telemetry::{metrics, SpanExt};

/// Channel capacity between a worker and its consumer.
pub const STREAM_BUFFER: usize = 16;

/// Create a bounded response channel for one streaming call.
pub fn channel(engine: impl Into<String>) -> (ResponseSender, ResponseStream) {
    let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
    (
        ResponseSender {
            sender,
            engine: engine.into(),
            started: Instant::now(),
        },
        ResponseStream { receiver },
    )
}

/// Receiving half of a streaming translation.
pub struct ResponseStream {
    receiver: mpsc::Receiver<Response>,
}

impl ResponseStream {
    /// Receive the next response. `None` once the worker has finished.
    pub async fn next(&mut self) -> Option<Response> {
        self.receiver.recv().await
    }

    /// Drain every remaining response up to and including the terminal one.
    pub async fn collect(mut self) -> Vec<Response> {
        let mut out = Vec::new();
        while let Some(response) = self.next().await {
            let terminal = response.is_terminal();
            out.push(response);
            if terminal {
                break;
            }
        }
        out
    }

    /// Drain the stream and assemble the final text.
    ///
    /// Delta streams are concatenated, cumulative streams keep the last
    /// non-empty text. A terminal error becomes `Err` with the message.
    pub async fn collect_text(self, mode: StreamMode) -> Result<String, String> {
        let mut text = String::new();
        for response in self.collect().await {
            if let Some(err) = response.error.filter(|e| !e.is_empty()) {
                return Err(err);
            }
            match mode {
                StreamMode::Delta => text.push_str(&response.text),
                StreamMode::Cumulative if !response.text.is_empty() => text = response.text,
                StreamMode::Cumulative => {}
            }
        }
        Ok(text)
    }
}

impl Stream for ResponseStream {
    type Item = Response;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Why a non-terminal delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The call's deadline scope fired while waiting for buffer space.
    Cancelled,
    /// The consumer dropped the stream.
    Closed,
}

/// Sending half owned by the worker of a streaming call.
pub struct ResponseSender {
    sender: mpsc::Sender<Response>,
    engine: String,
    started: Instant,
}

impl ResponseSender {
    /// Deliver a non-terminal fragment, giving up if `cancel` fires first.
    pub async fn send_delta(
        &self,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let response = Response::delta(text);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
            sent = self.sender.send(response) => sent.map_err(|_| DeliveryError::Closed),
        }
    }

    /// True once the consumer has dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Terminal success with no extra text.
    pub async fn finish(self) {
        self.finish_with(String::new()).await;
    }

    /// Terminal success carrying text (the final cumulative result, or empty).
    pub async fn finish_with(self, text: impl Into<String>) {
        self.record_outcome(&Ok(()));
        tracing::debug!(engine = %self.engine, "stream finished");
        let _ = self.sender.send(Response::complete(text)).await;
    }

    /// Terminal failure. Delivered even if the call's deadline already fired.
    pub async fn fail(self, err: &EngineError) {
        self.record_outcome(&Err(err));
        tracing::warn!(engine = %self.engine, error = %err, "stream failed");
        let _ = self.sender.send(Response::failed(err)).await;
    }

    /// Fill the current call span and count the outcome.
    fn record_outcome(&self, result: &Result<(), &EngineError>) {
        let elapsed = self.started.elapsed();
        let span = Span::current();
        span.record_result(result);
        span.record_latency(elapsed);
        let outcome = match result {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_translation(&self.engine, outcome, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delta_stream_concatenates() {
        let (tx, rx) = channel("test");
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            tx.send_delta("Hel", &cancel).await.unwrap();
            tx.send_delta("lo", &cancel).await.unwrap();
            tx.finish().await;
        });
        assert_eq!(rx.collect_text(StreamMode::Delta).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn cumulative_stream_keeps_last_text() {
        let (tx, rx) = channel("test");
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            tx.send_delta("Hel", &cancel).await.unwrap();
            tx.send_delta("Hello", &cancel).await.unwrap();
            tx.finish_with("Hello").await;
        });
        assert_eq!(rx.collect_text(StreamMode::Cumulative).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn error_terminates_collection() {
        let (tx, rx) = channel("test");
        tokio::spawn(async move {
            tx.fail(&EngineError::Timeout).await;
        });
        let err = rx.collect_text(StreamMode::Delta).await.unwrap_err();
        assert_eq!(err, "translation timed out");
    }

    #[tokio::test]
    async fn send_after_consumer_drop_reports_closed() {
        let (tx, rx) = channel("test");
        drop(rx);
        let cancel = CancellationToken::new();
        assert_eq!(tx.send_delta("x", &cancel).await, Err(DeliveryError::Closed));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn blocked_send_yields_to_cancellation() {
        let (tx, mut rx) = channel("test");
        let cancel = CancellationToken::new();
        for _ in 0..STREAM_BUFFER {
            tx.send_delta("x", &cancel).await.unwrap();
        }
        cancel.cancel();
        assert_eq!(tx.send_delta("y", &cancel).await, Err(DeliveryError::Cancelled));

        tokio::spawn(async move { tx.fail(&EngineError::Timeout).await });
        let mut seen = 0;
        while let Some(r) = rx.next().await {
            seen += 1;
            if r.is_terminal() {
                assert!(r.is_error());
            }
        }
        assert_eq!(seen, STREAM_BUFFER + 1);
    }
}

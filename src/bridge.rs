//! Hands tokens from the engine thread to an async consumer.
//!
//! Every streaming submission gets its own bounded channel. The engine side pushes
//! with a deadline so a stalled event loop turns into a logged [`HandoffError`]
//! instead of a hung engine thread; a vanished consumer flips the sender into
//! discard mode.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};

use crate::engine::EOS_SENTINEL;

pub const DEFAULT_CAPACITY: usize = 64;
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandoffError {
    #[error("request {request_id}: token handoff timed out after {waited:?}")]
    Timeout { request_id: u64, waited: Duration },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StreamFailure(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
enum BridgeItem {
    Token(String),
    Failed(String),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The consumer went away; the item was dropped.
    Discarded,
}

pub fn channel(request_id: u64, capacity: usize, timeout: Duration) -> (TokenSender, TokenStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TokenSender {
            request_id,
            tx,
            timeout,
            discarding: false,
        },
        TokenStream {
            request_id,
            rx,
            finished: false,
        },
    )
}

/// Producer half, owned by the thread that drives the engine.
#[derive(Debug)]
pub struct TokenSender {
    request_id: u64,
    tx: mpsc::Sender<BridgeItem>,
    timeout: Duration,
    discarding: bool,
}

impl TokenSender {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// One engine callback. [`EOS_SENTINEL`] ends the stream.
    pub fn push(&mut self, token: &str) -> Result<Delivery, HandoffError> {
        if token == EOS_SENTINEL {
            self.handoff(BridgeItem::End)
        } else {
            self.handoff(BridgeItem::Token(token.to_string()))
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<Delivery, HandoffError> {
        self.handoff(BridgeItem::Failed(message.into()))
    }

    fn handoff(&mut self, mut item: BridgeItem) -> Result<Delivery, HandoffError> {
        if self.discarding {
            return Ok(Delivery::Discarded);
        }

        let started = Instant::now();
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(Delivery::Delivered),
                Err(TrySendError::Closed(_)) => {
                    debug!(request_id = self.request_id, "token consumer gone, discarding remaining tokens");
                    self.discarding = true;
                    return Ok(Delivery::Discarded);
                }
                Err(TrySendError::Full(back)) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        error!(
                            request_id = self.request_id,
                            ?waited,
                            "token handoff failed: consumer did not drain the queue"
                        );
                        self.discarding = true;
                        return Err(HandoffError::Timeout {
                            request_id: self.request_id,
                            waited,
                        });
                    }
                    item = back;
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }
}

/// Consumer half: a single-pass stream of fragments that ends on the sentinel.
#[derive(Debug)]
pub struct TokenStream {
    request_id: u64,
    rx: mpsc::Receiver<BridgeItem>,
    finished: bool,
}

impl TokenStream {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Stream for TokenStream {
    type Item = Result<String, StreamFailure>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(BridgeItem::Token(token))) => Poll::Ready(Some(Ok(token))),
            Poll::Ready(Some(BridgeItem::End)) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(None)
            }
            Poll::Ready(Some(BridgeItem::Failed(message))) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(Some(Err(StreamFailure(message))))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(StreamFailure(
                    "generation ended without an end-of-stream marker".to_string(),
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_in_order_and_ends_on_sentinel() {
        let (mut tx, stream) = channel(1, 4, DEFAULT_HANDOFF_TIMEOUT);
        let producer = thread::spawn(move || {
            for i in 0..50 {
                tx.push(&format!("t{}", i)).expect("handoff");
            }
            tx.push(EOS_SENTINEL).expect("handoff end");
            tx.push("after-end").is_ok()
        });

        let received: Vec<String> = stream.map(|item| item.expect("token")).collect().await;
        let expected: Vec<String> = (0..50).map(|i| format!("t{}", i)).collect();
        assert_eq!(received, expected);
        assert!(producer.join().expect("producer thread"));
    }

    #[tokio::test]
    async fn dropped_consumer_switches_producer_to_discard() {
        let (mut tx, mut stream) = channel(2, 2, DEFAULT_HANDOFF_TIMEOUT);
        tx.push("a").expect("first token");
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        drop(stream);

        let outcome = thread::spawn(move || {
            let first = tx.push("b").expect("push after drop");
            let rest: Vec<Delivery> = (0..10).map(|_| tx.push("x").expect("discard")).collect();
            (first, rest, tx.is_discarding())
        })
        .join()
        .expect("producer thread");
        assert_eq!(outcome.0, Delivery::Discarded);
        assert!(outcome.1.iter().all(|d| *d == Delivery::Discarded));
        assert!(outcome.2);
    }

    #[tokio::test]
    async fn stalled_consumer_times_out_the_producer() {
        let (mut tx, _stream) = channel(3, 1, Duration::from_millis(20));
        let result = thread::spawn(move || {
            tx.push("fills the queue").expect("first fits");
            tx.push("blocks")
        })
        .join()
        .expect("producer thread");
        assert!(matches!(result, Err(HandoffError::Timeout { request_id: 3, .. })));
    }

    #[tokio::test]
    async fn failures_surface_once_then_stream_ends() {
        let (mut tx, stream) = channel(4, 8, DEFAULT_HANDOFF_TIMEOUT);
        tx.push("partial").expect("token");
        tx.fail("native status -1").expect("failure");
        drop(tx);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(
            items,
            vec![Ok("partial".to_string()), Err(StreamFailure("native status -1".to_string()))]
        );
    }

    #[tokio::test]
    async fn producer_dying_without_sentinel_is_reported() {
        let (mut tx, mut stream) = channel(5, 8, DEFAULT_HANDOFF_TIMEOUT);
        tx.push("x").expect("token");
        drop(tx);
        assert_eq!(stream.next().await, Some(Ok("x".to_string())));
        assert!(matches!(stream.next().await, Some(Err(_))));
        assert_eq!(stream.next().await, None);
    }
}

//! Response correlation queue for stream-based transports
//!
//! SSE and Stream-HTTP issue calls as a separate HTTP POST and receive the
//! result later as an event on a long-lived stream. The stream reader task
//! pushes every decoded response here; each call path awaits its own
//! correlation id under one total wall-clock deadline. A response whose id
//! matches no current waiter stays buffered for the caller it belongs to —
//! out-of-order results are never dropped. A response nobody ever claims is
//! discarded when the queue is cleared on disconnect.

use crate::mcp::types::McpResponse;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct QueueInner {
    /// Responses that arrived before (or without) a waiter
    buffer: VecDeque<McpResponse>,
    /// Call paths currently awaiting a correlation id
    waiters: HashMap<String, oneshot::Sender<McpResponse>>,
}

/// Concurrent producer/consumer buffer matching stream events to in-flight calls
pub struct ResponseQueue {
    inner: Mutex<QueueInner>,
    /// Buffered responses beyond this are dropped oldest-first
    max_buffered: usize,
}

impl ResponseQueue {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffer: VecDeque::new(),
                waiters: HashMap::new(),
            }),
            max_buffered,
        }
    }

    /// Deliver a response from the stream reader.
    ///
    /// Wakes the matching waiter when one is registered; otherwise buffers the
    /// response for a caller that has not reached the queue yet.
    pub fn push(&self, response: McpResponse) {
        let mut inner = self.inner.lock().expect("response queue poisoned");

        if let Some(waiter) = inner.waiters.remove(&response.id) {
            if let Err(response) = waiter.send(response) {
                // The caller timed out between registering and delivery;
                // discard by correlation-id mismatch semantics.
                debug!("Discarding response for abandoned request {}", response.id);
            }
            return;
        }

        if inner.buffer.len() >= self.max_buffered {
            if let Some(dropped) = inner.buffer.pop_front() {
                warn!("Response buffer full, dropping oldest response id={}", dropped.id);
            }
        }
        inner.buffer.push_back(response);
    }

    /// Await the response carrying `id` for at most `total_timeout`.
    ///
    /// Returns `None` on deadline expiry; the registration is withdrawn so a
    /// late result is discarded rather than leaking a waiter.
    pub async fn take(&self, id: &str, total_timeout: Duration) -> Option<McpResponse> {
        let receiver = {
            let mut inner = self.inner.lock().expect("response queue poisoned");

            if let Some(pos) = inner.buffer.iter().position(|r| r.id == id) {
                return inner.buffer.remove(pos);
            }

            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(id.to_string(), tx);
            rx
        };

        match tokio::time::timeout(total_timeout, receiver).await {
            Ok(Ok(response)) => Some(response),
            // Sender dropped: the queue was cleared on disconnect
            Ok(Err(_)) => None,
            Err(_) => {
                let mut inner = self.inner.lock().expect("response queue poisoned");
                inner.waiters.remove(id);
                None
            }
        }
    }

    /// Number of buffered, unclaimed responses
    pub fn buffered(&self) -> usize {
        self.inner.lock().expect("response queue poisoned").buffer.len()
    }

    /// Drop all buffered responses and fail all waiters (disconnect path)
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("response queue poisoned");
        inner.buffer.clear();
        inner.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::McpResponse;
    use serde_json::json;

    fn response(id: &str) -> McpResponse {
        McpResponse {
            jsonrpc: "2.0".to_string(),
            id: id.to_string(),
            result: Some(json!({"ok": true})),
            error: None,
        }
    }

    #[test]
    fn test_take_buffered_response() {
        tokio_test::block_on(async {
            let queue = ResponseQueue::new(16);
            queue.push(response("a"));
            let got = queue.take("a", Duration::from_millis(50)).await;
            assert_eq!(got.unwrap().id, "a");
        });
    }

    #[tokio::test]
    async fn test_out_of_order_results_are_kept_for_their_caller() {
        let queue = ResponseQueue::new(16);
        queue.push(response("other"));
        queue.push(response("mine"));

        let got = queue.take("mine", Duration::from_millis(50)).await;
        assert_eq!(got.unwrap().id, "mine");

        // The mismatched response is still available for its own caller.
        assert_eq!(queue.buffered(), 1);
        let got = queue.take("other", Duration::from_millis(50)).await;
        assert_eq!(got.unwrap().id, "other");
    }

    #[tokio::test]
    async fn test_take_wakes_on_late_push() {
        let queue = std::sync::Arc::new(ResponseQueue::new(16));
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.take("x", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(response("x"));

        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().id, "x");
    }

    #[tokio::test]
    async fn test_take_times_out_and_withdraws_waiter() {
        let queue = ResponseQueue::new(16);
        let got = queue.take("missing", Duration::from_millis(20)).await;
        assert!(got.is_none());

        // A late result lands in the buffer instead of waking a stale waiter.
        queue.push(response("missing"));
        assert_eq!(queue.buffered(), 1);
    }

    #[tokio::test]
    async fn test_clear_fails_pending_waiters() {
        let queue = std::sync::Arc::new(ResponseQueue::new(16));
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.take("x", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear();
        assert!(waiter.await.unwrap().is_none());
    }
}

//! Request/response correlation.
//!
//! Both transports can have many requests outstanding at once, and responses
//! may arrive in any order. The correlator hands out strictly increasing
//! request ids, parks a oneshot waiter per id, and resolves the matching
//! waiter when the transport's read loop delivers a response. The pending map
//! is the only state shared between callers and the read loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::error::McpError;
use crate::types::{JsonRpcResponse, RpcId};

/// Default window a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// Matches asynchronous responses to the requests that caused them.
///
/// Exactly one of resolve/reject ever fires for a registered id: the entry is
/// removed from the map before its waiter is signalled, and the timeout path
/// removes the entry before rejecting.
#[derive(Debug)]
pub struct Correlator {
    pending: Mutex<HashMap<RpcId, Waiter>>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    /// The request window applied by [`Correlator::wait`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate the next request id. Ids are never reused within a transport
    /// instance.
    pub fn next_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate an id and park a waiter for it.
    ///
    /// The caller must either hand the receiver to [`Correlator::wait`] or
    /// call [`Correlator::abandon`] if the request was never written.
    pub async fn register(&self) -> (RpcId, oneshot::Receiver<Result<JsonRpcResponse, McpError>>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        (id, rx)
    }

    /// Await the response for a registered id, enforcing the request window.
    ///
    /// Resolves with the `result` value on success, rejects with
    /// [`McpError::Tool`] when the server returned an `error` object, and with
    /// [`McpError::Timeout`] when the window elapses. On timeout the pending
    /// entry is removed so the id cannot resolve later.
    pub async fn wait(
        &self,
        id: &RpcId,
        rx: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    ) -> Result<serde_json::Value, McpError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                if let Some(err) = response.error {
                    return Err(McpError::from_rpc(err));
                }
                Ok(response.result.unwrap_or(serde_json::Value::Null))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => {
                // Waiter dropped without a send: the transport went away.
                self.pending.lock().await.remove(id);
                Err(McpError::Transport(
                    "response channel closed unexpectedly".to_string(),
                ))
            }
            Err(_) => {
                self.pending.lock().await.remove(id);
                Err(McpError::Timeout(self.timeout))
            }
        }
    }

    /// Resolve the waiter registered for `response.id`, if any.
    ///
    /// Returns false when no waiter matches; such responses indicate a stale
    /// or duplicate message and are logged and discarded by the caller.
    pub async fn complete(&self, response: JsonRpcResponse) -> bool {
        let waiter = self.pending.lock().await.remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => {
                debug!(id = %response.id, "response for unknown request id, discarding");
                false
            }
        }
    }

    /// Drop a registered id that was never written to the transport.
    pub async fn abandon(&self, id: &RpcId) {
        self.pending.lock().await.remove(id);
    }

    /// Reject every outstanding request. Used when the transport stops or
    /// fails; `reason` builds the error each waiter receives.
    pub async fn fail_all(&self, reason: impl Fn() -> McpError) {
        let mut map = self.pending.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(reason()));
        }
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_strictly_increase() {
        let correlator = Correlator::default();
        let a = correlator.next_id();
        let b = correlator.next_id();
        match (a, b) {
            (RpcId::Number(a), RpcId::Number(b)) => assert!(b > a),
            other => panic!("expected numeric ids, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_pair_with_their_own_ids() {
        // Register N waiters, resolve them in shuffled order, and check every
        // caller gets the result addressed to its own id.
        let correlator = std::sync::Arc::new(Correlator::default());

        let mut registered = Vec::new();
        for _ in 0..8 {
            let (id, rx) = correlator.register().await;
            registered.push((id, rx));
        }

        let ids: Vec<RpcId> = registered.iter().map(|(id, _)| id.clone()).collect();
        let resolver = {
            let correlator = correlator.clone();
            let mut shuffled = ids.clone();
            shuffled.reverse();
            shuffled.swap(0, 3);
            tokio::spawn(async move {
                for id in shuffled {
                    let payload = json!({"echo": id.to_string()});
                    correlator
                        .complete(JsonRpcResponse::success(id, payload))
                        .await;
                }
            })
        };

        for (id, rx) in registered {
            let result = correlator.wait(&id, rx).await.unwrap();
            assert_eq!(result["echo"], id.to_string());
        }
        resolver.await.unwrap();
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_clears_pending_entry() {
        let correlator = Correlator::new(Duration::from_millis(50));
        let (id, rx) = correlator.register().await;
        assert_eq!(correlator.pending_count().await, 1);

        let err = correlator.wait(&id, rx).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert_eq!(correlator.pending_count().await, 0);

        // A late response for the timed-out id is discarded.
        let late = JsonRpcResponse::success(id, json!("late"));
        assert!(!correlator.complete(late).await);
    }

    #[tokio::test]
    async fn test_server_error_becomes_tool_error() {
        let correlator = Correlator::default();
        let (id, rx) = correlator.register().await;
        correlator
            .complete(JsonRpcResponse::error(
                id.clone(),
                404,
                "Tool 'no_such_tool' not found",
            ))
            .await;

        let err = correlator.wait(&id, rx).await.unwrap_err();
        match err {
            McpError::Tool { code, message, .. } => {
                assert_eq!(code, 404);
                assert_eq!(message, "Tool 'no_such_tool' not found");
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_discarded() {
        let correlator = Correlator::default();
        let stale = JsonRpcResponse::success(RpcId::Number(999), json!(null));
        assert!(!correlator.complete(stale).await);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything_pending() {
        let correlator = Correlator::default();
        let (id_a, rx_a) = correlator.register().await;
        let (id_b, rx_b) = correlator.register().await;

        correlator
            .fail_all(|| McpError::Shutdown("transport stopped".to_string()))
            .await;
        assert_eq!(correlator.pending_count().await, 0);

        for (id, rx) in [(id_a, rx_a), (id_b, rx_b)] {
            let err = correlator.wait(&id, rx).await.unwrap_err();
            assert!(matches!(err, McpError::Shutdown(_)), "id {id} got {err:?}");
        }
    }

    #[tokio::test]
    async fn test_abandon_removes_entry() {
        let correlator = Correlator::default();
        let (id, _rx) = correlator.register().await;
        correlator.abandon(&id).await;
        assert_eq!(correlator.pending_count().await, 0);
    }
}

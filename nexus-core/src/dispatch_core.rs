//! Shared request/response plumbing used by both the per-agent
//! [`crate::dispatcher::Dispatcher`] and the [`crate::global_dispatcher::GlobalDispatcher`]:
//! notifications (no `id`) never produce a response, and handler errors are
//! mapped onto the JSON-RPC error taxonomy uniformly.

use nexus_protocol::INTERNAL_ERROR;
use nexus_protocol::INVALID_PARAMS;
use nexus_protocol::Response;
use nexus_protocol::make_error_response;
use nexus_protocol::make_success_response;
use serde_json::Value;

pub enum DispatchError {
    InvalidParams(String),
    Internal(String),
}

impl DispatchError {
    fn code(&self) -> i64 {
        match self {
            DispatchError::InvalidParams(_) => INVALID_PARAMS,
            DispatchError::Internal(_) => INTERNAL_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            DispatchError::InvalidParams(msg) | DispatchError::Internal(msg) => msg,
        }
    }
}

/// Turn a handler's outcome into a response, or `None` for notifications.
/// A notification (`id` is `None`) that errors is logged, not reported: the
/// caller has no way to receive a response for it.
pub fn respond(id: Option<nexus_protocol::RequestId>, outcome: Result<Value, DispatchError>) -> Option<Response> {
    match outcome {
        Ok(result) => id.map(|id| make_success_response(Some(id), result)),
        Err(err) => {
            if id.is_none() {
                tracing::warn!(message = err.message(), "notification handler failed");
                return None;
            }
            id.map(|id| make_error_response(Some(id), err.code(), err.message().to_string(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_protocol::RequestId;
    use serde_json::json;

    #[test]
    fn notification_errors_produce_no_response() {
        let outcome: Result<Value, DispatchError> =
            Err(DispatchError::InvalidParams("bad".into()));
        assert!(respond(None, outcome).is_none());
    }

    #[test]
    fn success_carries_result() {
        let outcome: Result<Value, DispatchError> = Ok(json!({"ok": true}));
        let resp = respond(Some(RequestId::Number(1)), outcome).unwrap();
        assert_eq!(resp.result.unwrap(), json!({"ok": true}));
    }
}

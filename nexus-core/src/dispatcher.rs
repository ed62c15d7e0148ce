//! Per-agent dispatcher: routes `send`/`cancel`/`get_tokens`/`get_context`/
//! `shutdown` and owns the request-scoped cancellation-token registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use nexus_protocol::METHOD_NOT_FOUND;
use nexus_protocol::Request;
use nexus_protocol::Response;
use nexus_protocol::make_error_response;
use serde_json::Value;
use serde_json::json;

use crate::cancel::CancellationToken;
use crate::dispatch_core::DispatchError;
use crate::dispatch_core::respond;
use crate::session::ContextManager;
use crate::session::Session;

pub struct Dispatcher {
    session: Arc<dyn Session>,
    context: Arc<dyn ContextManager>,
    should_shutdown: AtomicBool,
    active_requests: StdMutex<HashMap<String, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(session: Arc<dyn Session>, context: Arc<dyn ContextManager>) -> Self {
        Self {
            session,
            context,
            should_shutdown: AtomicBool::new(false),
            active_requests: StdMutex::new(HashMap::new()),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.should_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn cancel_all_requests(&self) {
        let guard = self.active_requests.lock().unwrap_or_else(|e| e.into_inner());
        for token in guard.values() {
            token.cancel();
        }
    }

    pub async fn dispatch(&self, request: Request) -> Option<Response> {
        let method = request.method.clone();
        match method.as_str() {
            "send" => self.dispatch_one(request, |p| self.handle_send(p)).await,
            "cancel" => self.dispatch_one(request, |p| self.handle_cancel(p)).await,
            "get_tokens" => {
                self.dispatch_one(request, |p| self.handle_get_tokens(p)).await
            }
            "get_context" => {
                self.dispatch_one(request, |p| self.handle_get_context(p)).await
            }
            "shutdown" => {
                self.dispatch_one(request, |p| self.handle_shutdown(p)).await
            }
            _ => request.id.map(|id| {
                make_error_response(
                    Some(id),
                    METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                    None,
                )
            }),
        }
    }

    async fn dispatch_one<F, Fut>(&self, request: Request, handler: F) -> Option<Response>
    where
        F: FnOnce(Value) -> Fut,
        Fut: std::future::Future<Output = Result<Value, DispatchError>>,
    {
        let id = request.id.clone();
        let params = request.params.clone().unwrap_or(json!({}));
        respond(id, handler(params).await)
    }

    async fn handle_send(&self, params: Value) -> Result<Value, DispatchError> {
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidParams("Missing required parameter: content".into()))?;

        let request_id = params
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| generate_request_id());

        let token = CancellationToken::new();
        self.active_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), token.clone());

        let mut rx = self.session.send(content, token.clone()).await;
        let mut chunks = Vec::new();
        let mut cancelled = false;
        while let Some(chunk) = rx.recv().await {
            if token.raise_if_cancelled().is_err() {
                cancelled = true;
                break;
            }
            chunks.push(chunk);
        }

        self.active_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);

        if cancelled {
            Ok(json!({"cancelled": true, "request_id": request_id}))
        } else {
            Ok(json!({"content": chunks.join(""), "request_id": request_id}))
        }
    }

    async fn handle_cancel(&self, params: Value) -> Result<Value, DispatchError> {
        let request_id = params
            .get("request_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::InvalidParams("Missing required parameter: request_id".into()))?;

        let token = self
            .active_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned();

        match token {
            Some(token) => {
                token.cancel();
                Ok(json!({"cancelled": true, "request_id": request_id}))
            }
            None => Ok(json!({
                "cancelled": false,
                "request_id": request_id,
                "reason": "not_found_or_completed",
            })),
        }
    }

    async fn handle_get_tokens(&self, _params: Value) -> Result<Value, DispatchError> {
        Ok(self.context.token_usage())
    }

    async fn handle_get_context(&self, _params: Value) -> Result<Value, DispatchError> {
        Ok(json!({
            "message_count": self.context.message_count(),
            "system_prompt": self.context.has_system_prompt(),
        }))
    }

    async fn handle_shutdown(&self, _params: Value) -> Result<Value, DispatchError> {
        self.request_shutdown();
        Ok(json!({"success": true}))
    }
}

fn generate_request_id() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 8];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EchoSession;
    use crate::session::NullContextManager;
    use nexus_protocol::RequestId;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(EchoSession), Arc::new(NullContextManager))
    }

    fn req(method: &str, params: Value, id: i64) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: Some(RequestId::Number(id)),
        }
    }

    #[tokio::test]
    async fn send_echoes_content_and_generates_request_id() {
        let d = dispatcher();
        let resp = d
            .dispatch(req("send", json!({"content": "hi"}), 1))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["content"], "hi");
        assert!(result["request_id"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn send_rejects_missing_content() {
        let d = dispatcher();
        let resp = d.dispatch(req("send", json!({}), 1)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, nexus_protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_not_an_error() {
        let d = dispatcher();
        let resp = d
            .dispatch(req("cancel", json!({"request_id": "nope"}), 1))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["cancelled"], false);
        assert_eq!(result["reason"], "not_found_or_completed");
    }

    #[tokio::test]
    async fn shutdown_sets_flag() {
        let d = dispatcher();
        assert!(!d.should_shutdown());
        d.dispatch(req("shutdown", json!({}), 1)).await;
        assert!(d.should_shutdown());
    }

    #[tokio::test]
    async fn unknown_method_not_found() {
        let d = dispatcher();
        let resp = d.dispatch(req("bogus", json!({}), 1)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, nexus_protocol::METHOD_NOT_FOUND);
    }
}

//! JSON-RPC 2.0 request/response types and codec.
//!
//! Wire format is a single JSON object per line (no batching, no array
//! params — named params only). This mirrors the protocol used throughout
//! the rest of the workspace for both the server's public RPC surface and
//! the MCP client's own request/response framing.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Start of the reserved server-error range (`-32000` to `-32099`).
pub const SERVER_ERROR: i64 = -32000;

/// A JSON-RPC id: a string, a number, or absent (a notification).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// A request failed to parse. `Syntax` is not-even-JSON input (maps to
/// `PARSE_ERROR`/400); `Shape` is well-formed JSON that isn't a valid
/// JSON-RPC request (maps to `INVALID_REQUEST`, returned as a 200 with an
/// RPC error body) — callers route on [`ParseError::is_syntax`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    Shape(String),
}

impl ParseError {
    pub fn message(&self) -> &str {
        match self {
            ParseError::Syntax(m) | ParseError::Shape(m) => m,
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, ParseError::Syntax(_))
    }
}

fn syntax_err(msg: impl Into<String>) -> ParseError {
    ParseError::Syntax(msg.into())
}

fn shape_err(msg: impl Into<String>) -> ParseError {
    ParseError::Shape(msg.into())
}

/// Parse a single line of JSON text into a [`Request`].
pub fn parse_request(line: &str) -> Result<Request, ParseError> {
    let data: Value =
        serde_json::from_str(line).map_err(|e| syntax_err(format!("Invalid JSON: {e}")))?;

    let obj = data
        .as_object()
        .ok_or_else(|| shape_err("Request must be a JSON object"))?;

    let jsonrpc = obj.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(shape_err(format!(
            "jsonrpc must be '2.0', got: {:?}",
            obj.get("jsonrpc")
        )));
    }

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            shape_err(format!(
                "method must be a string, got: {:?}",
                obj.get("method")
            ))
        })?
        .to_string();

    let params = match obj.get("params") {
        None | Some(Value::Null) => None,
        Some(Value::Array(_)) => {
            return Err(shape_err(
                "Positional params (array) not supported, use named params (object)",
            ));
        }
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(other) => {
            return Err(shape_err(format!(
                "params must be object or array, got: {other}"
            )));
        }
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        Some(Value::Number(n)) => Some(RequestId::Number(
            n.as_i64()
                .ok_or_else(|| shape_err("id must be an integer"))?,
        )),
        Some(other) => {
            return Err(shape_err(format!(
                "id must be string, number, or null, got: {other}"
            )));
        }
    };

    Ok(Request {
        jsonrpc: "2.0".to_string(),
        method,
        params,
        id,
    })
}

/// Serialize a [`Response`] to a single compact JSON line (no trailing newline).
pub fn serialize_response(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        serialize_response(&make_error_response(
            response.id.clone(),
            INTERNAL_ERROR,
            format!("failed to serialize response: {e}"),
            None,
        ))
    })
}

pub fn make_error_response(
    request_id: Option<RequestId>,
    code: i64,
    message: impl Into<String>,
    data: Option<Value>,
) -> Response {
    Response {
        jsonrpc: "2.0".to_string(),
        id: request_id,
        result: None,
        error: Some(RpcErrorBody {
            code,
            message: message.into(),
            data,
        }),
    }
}

pub fn make_success_response(request_id: Option<RequestId>, result: Value) -> Response {
    Response {
        jsonrpc: "2.0".to_string(),
        id: request_id,
        result: Some(result),
        error: None,
    }
}

/// Serialize a client-originated [`Request`] to a single JSON line. Used by
/// server-detection probes and by the MCP client, which speak the same wire
/// format back the other direction.
pub fn serialize_request(request: &Request) -> String {
    serde_json::to_string(request).unwrap_or_default()
}

/// Parse a single line of JSON text into a [`Response`].
pub fn parse_response(line: &str) -> Result<Response, ParseError> {
    serde_json::from_str(line).map_err(|e| syntax_err(format!("Invalid JSON response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_well_formed_request() {
        let req = parse_request(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert_eq!(req.id, Some(RequestId::Number(1)));
        assert!(req.params.is_none());
    }

    #[test]
    fn notification_has_no_id() {
        let req = parse_request(r#"{"jsonrpc":"2.0","method":"notify"}"#).unwrap();
        assert_eq!(req.id, None);
    }

    #[test]
    fn rejects_wrong_jsonrpc_version() {
        let err = parse_request(r#"{"jsonrpc":"1.0","method":"ping"}"#).unwrap_err();
        assert!(!err.is_syntax());
        assert!(err.message().contains("jsonrpc"));
    }

    #[test]
    fn rejects_array_params() {
        let err = parse_request(r#"{"jsonrpc":"2.0","method":"ping","params":[1,2]}"#)
            .unwrap_err();
        assert!(!err.is_syntax());
        assert!(err.message().contains("Positional params"));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = parse_request("[1,2,3]").unwrap_err();
        assert!(!err.is_syntax());
        assert!(err.message().contains("JSON object"));
    }

    #[test]
    fn rejects_malformed_json_as_syntax_error() {
        let err = parse_request("{not json").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn success_response_round_trips() {
        let resp = make_success_response(
            Some(RequestId::String("abc".into())),
            serde_json::json!({"ok": true}),
        );
        let line = serialize_response(&resp);
        let parsed: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, Some(RequestId::String("abc".into())));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn error_response_omits_result() {
        let resp = make_error_response(Some(RequestId::Number(7)), METHOD_NOT_FOUND, "nope", None);
        let line = serialize_response(&resp);
        assert!(!line.contains("\"result\""));
        assert!(line.contains("-32601"));
    }
}

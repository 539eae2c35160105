//! JSON-RPC 2.0 envelopes

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RuntimeError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

/// Incoming call. Without an `id` it is a notification and gets no response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
}

impl RpcRequest {
    pub fn new(id: RpcId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {}", detail))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {}", detail))
    }
}

/// Runtime errors keep their kind code; the full error travels in `data`
impl From<RuntimeError> for RpcError {
    fn from(error: RuntimeError) -> Self {
        Self {
            code: error.code(),
            message: error.message.clone(),
            data: serde_json::to_value(&error).ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// `null` when the request id could not be determined
    pub id: Option<RpcId>,
}

impl RpcResponse {
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<RpcId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Server-initiated message, e.g. a streamed token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Anything written to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
}

/// Parses one line into a request, or the error response to send back
pub fn parse_request(line: &str) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RpcResponse::failure(None, RpcError::parse_error(e)))?;

    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RpcId>(id).ok());

    if !value.is_object() {
        return Err(RpcResponse::failure(
            None,
            RpcError::invalid_request("expected a JSON object"),
        ));
    }
    if value.get("jsonrpc") != Some(&json!(JSONRPC_VERSION)) {
        return Err(RpcResponse::failure(
            id,
            RpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    serde_json::from_value(value).map_err(|e| RpcResponse::failure(id, RpcError::invalid_request(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_request_with_numeric_and_string_ids() {
        let request =
            parse_request(r#"{"jsonrpc":"2.0","method":"detectCapabilities","id":7}"#).unwrap();
        assert_eq!(request.id, Some(RpcId::Number(7)));
        assert_eq!(request.params, Value::Null);

        let request =
            parse_request(r#"{"jsonrpc":"2.0","method":"queryAudit","params":{},"id":"a"}"#)
                .unwrap();
        assert_eq!(request.id, Some(RpcId::String("a".to_string())));
        assert!(!request.is_notification());
    }

    #[test]
    fn test_parse_errors() {
        let response = parse_request("{not json").unwrap_err();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
        assert_eq!(response.id, None);

        let response = parse_request(r#"{"jsonrpc":"1.0","method":"x","id":3}"#).unwrap_err();
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
        assert_eq!(response.id, Some(RpcId::Number(3)));

        let response = parse_request(r#"{"jsonrpc":"2.0","id":4}"#).unwrap_err();
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);

        let response = parse_request("[1,2]").unwrap_err();
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_runtime_error_keeps_kind_code() {
        let error: RpcError = RuntimeError::model_not_found("phi-2").into();
        assert_eq!(error.code, ErrorKind::Model.code());
        assert_eq!(error.message, "Model 'phi-2' not found in catalog");
        let data = error.data.unwrap();
        assert_eq!(data["kind"], "ModelError");
        assert_eq!(data["context"]["model_id"], "phi-2");
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_value(RpcResponse::success(
            Some(RpcId::Number(1)),
            json!({"ok": true}),
        ))
        .unwrap();
        assert_eq!(ok["jsonrpc"], "2.0");
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(RpcResponse::failure(None, RpcError::parse_error("x")))
            .unwrap();
        assert!(failed.get("result").is_none());
        assert_eq!(failed["id"], Value::Null);
    }
}

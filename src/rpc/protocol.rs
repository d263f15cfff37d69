//! Wire shapes for the analysis RPC.
//!
//! Three message kinds travel over a connection:
//!
//! - `Request { id, method, params }`
//! - `Response { id, result }` or `Response { id, error }`
//! - `Notification { type, data }`, which has no id and goes to every peer
//!
//! Messages carry no version field. Peers negotiate by calling
//! [`VERSION_METHOD`] instead.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::error::TinctureError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Bumped whenever a method's params or result change shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Built-in method answering `{ protocol, server }`.
pub const VERSION_METHOD: &str = "protocol/version";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// `Ok(result)` or `Err(error)`. A response with neither yields `null`.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Structured error carried in `Response.error`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {detail}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl From<TinctureError> for ErrorObject {
    fn from(error: TinctureError) -> Self {
        ErrorObject::internal(error.to_string()).with_data(json!({ "kind": error.kind() }))
    }
}

/// A decoded message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Incoming {
    /// Parse one frame body.
    ///
    /// Bytes that are not JSON yield a `-32700` error. Anything with a
    /// `method` key is a request, and the method must be a non-empty string
    /// (`-32600` otherwise). Objects with `result` or `error` are
    /// responses, objects with a string `type` are notifications.
    pub fn parse(bytes: &[u8]) -> Result<Self, (Value, ErrorObject)> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| (Value::Null, ErrorObject::parse_error(e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, (Value, ErrorObject)> {
        let Value::Object(object) = &value else {
            return Err((
                Value::Null,
                ErrorObject::invalid_request("message must be a JSON object"),
            ));
        };
        let id = object.get("id").cloned().unwrap_or(Value::Null);

        if let Some(method) = object.get("method") {
            return match method.as_str() {
                Some(name) if !name.is_empty() => serde_json::from_value(value)
                    .map(Incoming::Request)
                    .map_err(|e| (id, ErrorObject::invalid_request(e))),
                _ => Err((
                    id,
                    ErrorObject::invalid_request("method must be a non-empty string"),
                )),
            };
        }

        if object.contains_key("result") || object.contains_key("error") {
            return serde_json::from_value(value)
                .map(Incoming::Response)
                .map_err(|e| (id, ErrorObject::invalid_request(e)));
        }

        if object.get("type").is_some_and(Value::is_string) {
            return serde_json::from_value(value)
                .map(Incoming::Notification)
                .map_err(|e| (id, ErrorObject::invalid_request(e)));
        }

        Err((
            id,
            ErrorObject::invalid_request("not a request, response or notification"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn garbage_is_a_parse_error() {
        let (id, error) = Incoming::parse(b"{not json").unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(error.code, PARSE_ERROR);
    }

    #[rstest]
    #[case::empty_method(json!({"id": 1, "method": ""}))]
    #[case::numeric_method(json!({"id": 1, "method": 7}))]
    #[case::null_method(json!({"id": 1, "method": null}))]
    fn bad_method_is_invalid_request(#[case] message: Value) {
        let (id, error) = Incoming::from_value(message).unwrap_err();
        assert_eq!(id, json!(1));
        assert_eq!(error.code, INVALID_REQUEST);
    }

    #[test]
    fn non_object_is_invalid_request() {
        let (_, error) = Incoming::parse(b"[1, 2]").unwrap_err();
        assert_eq!(error.code, INVALID_REQUEST);
    }

    #[test]
    fn classifies_each_shape() {
        assert!(matches!(
            Incoming::from_value(json!({"id": 3, "method": "tokens/raw", "params": {}})),
            Ok(Incoming::Request(Request { ref method, .. })) if method == "tokens/raw"
        ));
        assert!(matches!(
            Incoming::from_value(json!({"id": 3, "result": null})),
            Ok(Incoming::Response(_))
        ));
        assert!(matches!(
            Incoming::from_value(json!({"type": "themes:updated", "data": {"id": "dark"}})),
            Ok(Incoming::Notification(Notification { ref kind, .. })) if kind == "themes:updated"
        ));
    }

    #[test]
    fn request_without_params_defaults_to_null() {
        let Ok(Incoming::Request(request)) = Incoming::from_value(json!({"id": 1, "method": "m"}))
        else {
            panic!("expected request");
        };
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn failure_response_omits_result() {
        let response = Response::failure(json!(9), ErrorObject::method_not_found("nope"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], METHOD_NOT_FOUND);
        assert!(json.get("result").is_none());
        assert!(json["error"].get("data").is_none());
    }

    #[test]
    fn notification_uses_type_on_the_wire() {
        let json = serde_json::to_value(Notification::new("types:invalidated", json!([]))).unwrap();
        assert_eq!(json, json!({"type": "types:invalidated", "data": []}));
    }

    #[test]
    fn tincture_errors_become_internal_errors_with_kind() {
        let error: ErrorObject = TinctureError::theme_not_found("nord").into();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.data, Some(json!({"kind": "themeNotFound"})));
        assert!(error.message.contains("nord"));
    }
}

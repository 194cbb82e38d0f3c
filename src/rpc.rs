use serde_json::{Map, Value};

use crate::error::GatewayError;

/// JSON-RPC dialect. v1 requests have no `jsonrpc` member and expect
/// `result`/`error` to both be present on replies; v2 tags both sides with
/// `"jsonrpc": "2.0"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcVersion {
    V1,
    V2,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RpcId {
    Null,
    Number(i64),
    String(String),
}

impl RpcId {
    pub fn to_value(&self) -> Value {
        match self {
            RpcId::Null => Value::Null,
            RpcId::Number(n) => json!(n),
            RpcId::String(s) => json!(s),
        }
    }
}

#[derive(Clone, Debug)]
pub enum RpcParams {
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl RpcParams {
    pub fn len(&self) -> usize {
        match self {
            RpcParams::None => 0,
            RpcParams::Positional(values) => values.len(),
            RpcParams::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct RpcRequest {
    pub version: RpcVersion,
    /// `None` when the id member is absent altogether.
    pub id: Option<RpcId>,
    pub method: String,
    pub params: RpcParams,
}

impl RpcRequest {
    pub fn parse(value: Value) -> Result<RpcRequest, GatewayError> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err(GatewayError::BadStream),
        };

        let version = match object.get("jsonrpc") {
            None => RpcVersion::V1,
            Some(Value::String(tag)) if tag == "2.0" => RpcVersion::V2,
            Some(Value::String(tag)) if tag == "1.0" => RpcVersion::V1,
            Some(_) => return Err(GatewayError::BadStream),
        };

        let id = match object.remove("id") {
            None => None,
            Some(Value::Null) => Some(RpcId::Null),
            Some(Value::Number(n)) => {
                Some(RpcId::Number(n.as_i64().ok_or(GatewayError::InvalidArgument)?))
            }
            Some(Value::String(s)) => Some(RpcId::String(s)),
            Some(_) => return Err(GatewayError::InvalidArgument),
        };

        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err(GatewayError::BadStream),
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => RpcParams::None,
            Some(Value::Array(values)) => RpcParams::Positional(values),
            Some(Value::Object(map)) => RpcParams::Named(map),
            Some(_) => return Err(GatewayError::InvalidArgument),
        };

        Ok(RpcRequest {
            version,
            id,
            method,
            params,
        })
    }

    pub fn parse_str(line: &str) -> Result<RpcRequest, GatewayError> {
        let value: Value = serde_json::from_str(line).map_err(|_| GatewayError::BadStream)?;
        RpcRequest::parse(value)
    }

    /// Notifications get no response: a v2 request without an id, or a v1
    /// request with a null (or absent) id.
    pub fn is_notification(&self) -> bool {
        match self.version {
            RpcVersion::V2 => self.id.is_none(),
            RpcVersion::V1 => matches!(self.id, None | Some(RpcId::Null)),
        }
    }

    fn id_value(&self) -> Value {
        self.id.as_ref().map_or(Value::Null, RpcId::to_value)
    }

    pub fn response_ok(&self, result: Value) -> Value {
        match self.version {
            RpcVersion::V2 => json!({
                "jsonrpc": "2.0",
                "id": self.id_value(),
                "result": result,
            }),
            RpcVersion::V1 => json!({
                "id": self.id_value(),
                "result": result,
                "error": Value::Null,
            }),
        }
    }

    pub fn response_err(&self, code: i32, message: &str) -> Value {
        let error = json!({ "code": code, "message": message });
        match self.version {
            RpcVersion::V2 => json!({
                "jsonrpc": "2.0",
                "id": self.id_value(),
                "error": error,
            }),
            RpcVersion::V1 => json!({
                "id": self.id_value(),
                "result": Value::Null,
                "error": error,
            }),
        }
    }

    pub fn response_gateway_err(&self, err: GatewayError) -> Value {
        self.response_err(err.rpc_code(), &err.to_string())
    }
}

/// A server-initiated v2 notification (no id).
pub fn rpc_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v2_request() {
        let req = RpcRequest::parse_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"server.ping","params":[]}"#,
        )
        .unwrap();
        assert_eq!(req.version, RpcVersion::V2);
        assert_eq!(req.id, Some(RpcId::Number(1)));
        assert_eq!(req.method, "server.ping");
        assert!(!req.is_notification());
    }

    #[test]
    fn parses_v1_request() {
        let req =
            RpcRequest::parse_str(r#"{"id":"a","method":"getblockcount","params":[]}"#).unwrap();
        assert_eq!(req.version, RpcVersion::V1);
        assert_eq!(req.id, Some(RpcId::String("a".into())));
    }

    #[test]
    fn detects_notifications() {
        let v2 = RpcRequest::parse_str(r#"{"jsonrpc":"2.0","method":"m"}"#).unwrap();
        assert!(v2.is_notification());
        let v2_null = RpcRequest::parse_str(r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#).unwrap();
        assert!(!v2_null.is_notification());
        let v1 = RpcRequest::parse_str(r#"{"id":null,"method":"m"}"#).unwrap();
        assert!(v1.is_notification());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            RpcRequest::parse_str("not json").unwrap_err(),
            GatewayError::BadStream
        );
        assert_eq!(
            RpcRequest::parse_str(r#"{"jsonrpc":"2.0","params":[]}"#).unwrap_err(),
            GatewayError::BadStream
        );
        assert_eq!(
            RpcRequest::parse_str(r#"{"jsonrpc":"2.0","method":"m","params":3}"#).unwrap_err(),
            GatewayError::InvalidArgument
        );
    }

    #[test]
    fn response_shapes() {
        let req = RpcRequest::parse_str(r#"{"jsonrpc":"2.0","id":7,"method":"m"}"#).unwrap();
        assert_eq!(
            req.response_ok(json!(true)),
            json!({"jsonrpc": "2.0", "id": 7, "result": true})
        );

        let v1 = RpcRequest::parse_str(r#"{"id":7,"method":"m"}"#).unwrap();
        assert_eq!(
            v1.response_ok(json!(true)),
            json!({"id": 7, "result": true, "error": null})
        );
        assert_eq!(
            v1.response_err(-32601, "method not found")["error"]["code"],
            json!(-32601)
        );
    }
}

use serde_json::{Number, Value};

use crate::error::GatewayError;
use crate::rpc::{RpcParams, RpcRequest};

/// The semantic type a method parameter is validated against before its
/// handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Anything goes, including null (used where a parameter is shape-
    /// polymorphic, e.g. electrum's protocol_version).
    Any,
}

/// Table-encodable default for an optional parameter.
#[derive(Clone, Copy, Debug)]
pub enum ParamDefault {
    Null,
    Bool(bool),
    Number(f64),
    Str(&'static str),
    EmptyArray,
    EmptyObject,
}

impl ParamDefault {
    fn to_value(self) -> Value {
        match self {
            ParamDefault::Null => Value::Null,
            ParamDefault::Bool(b) => Value::Bool(b),
            ParamDefault::Number(n) => json!(n),
            ParamDefault::Str(s) => Value::String(s.into()),
            ParamDefault::EmptyArray => Value::Array(vec![]),
            ParamDefault::EmptyObject => json!({}),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    /// `None` makes the parameter required.
    pub default: Option<ParamDefault>,
}

pub const fn required(name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        default: None,
    }
}

pub const fn optional(name: &'static str, kind: ParamKind, default: ParamDefault) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        default: Some(default),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MethodSpec {
    pub name: &'static str,
    pub params: &'static [ParamSpec],
    /// Declared but answered with `not_implemented`.
    pub implemented: bool,
}

pub const fn method(name: &'static str, params: &'static [ParamSpec]) -> MethodSpec {
    MethodSpec {
        name,
        params,
        implemented: true,
    }
}

pub const fn placeholder(name: &'static str, params: &'static [ParamSpec]) -> MethodSpec {
    MethodSpec {
        name,
        params,
        implemented: false,
    }
}

impl MethodSpec {
    fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }
}

/// A request vetted against its table entry: every declared parameter is
/// present (defaults filled in) and of its declared kind, in table order.
#[derive(Debug)]
pub struct Dispatched<'t> {
    pub spec: &'t MethodSpec,
    pub args: Vec<Value>,
}

/// Match a decoded request against a method table.
///
/// `tolerant` makes extra trailing positional params ignored instead of
/// rejected (bitcoind compatibility).
pub fn dispatch<'t>(
    table: &'t [MethodSpec],
    request: &RpcRequest,
    tolerant: bool,
) -> Result<Dispatched<'t>, GatewayError> {
    let spec = table
        .iter()
        .find(|m| m.name == request.method)
        .ok_or(GatewayError::MethodNotFound)?;

    if !spec.implemented {
        return Err(GatewayError::NotImplemented);
    }

    let supplied = match &request.params {
        RpcParams::None => Vec::new(),
        RpcParams::Positional(values) => {
            if values.len() > spec.params.len() && !tolerant {
                return Err(GatewayError::InvalidArgument);
            }
            values.iter().take(spec.params.len()).cloned().collect()
        }
        RpcParams::Named(map) => {
            let mut positioned = Vec::with_capacity(spec.params.len());
            for param in spec.params {
                match map.get(param.name) {
                    Some(value) => positioned.push(value.clone()),
                    // a named-form gap behaves like a trailing omission
                    None => break,
                }
            }
            if !tolerant {
                let known = map
                    .keys()
                    .filter(|k| spec.params.iter().any(|p| p.name == k.as_str()))
                    .count();
                if known != map.len() {
                    return Err(GatewayError::InvalidArgument);
                }
            }
            positioned
        }
    };

    if supplied.len() < spec.required_count() {
        return Err(GatewayError::InvalidArgument);
    }

    let mut args = Vec::with_capacity(spec.params.len());
    for (index, param) in spec.params.iter().enumerate() {
        let value = supplied.get(index).cloned().unwrap_or(Value::Null);
        args.push(coerce(param, value)?);
    }

    Ok(Dispatched { spec, args })
}

/// Type-check one argument, substituting the default for null/omitted
/// optionals.
fn coerce(param: &ParamSpec, value: Value) -> Result<Value, GatewayError> {
    if value.is_null() {
        return match param.default {
            Some(default) => Ok(default.to_value()),
            None => Err(GatewayError::InvalidArgument),
        };
    }

    let ok = match param.kind {
        ParamKind::String => value.is_string(),
        ParamKind::Number => value.as_f64().map_or(false, f64::is_finite),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Object => value.is_object(),
        ParamKind::Array => value.is_array(),
        ParamKind::Any => true,
    };

    if ok {
        Ok(value)
    } else {
        Err(GatewayError::InvalidArgument)
    }
}

// Typed accessors for vetted args. Index panics are precluded by dispatch
// filling every declared parameter slot.

pub fn arg_str<'a>(args: &'a [Value], index: usize) -> Result<&'a str, GatewayError> {
    args[index].as_str().ok_or(GatewayError::InvalidArgument)
}

pub fn arg_f64(args: &[Value], index: usize) -> Result<f64, GatewayError> {
    args[index].as_f64().ok_or(GatewayError::InvalidArgument)
}

pub fn arg_bool(args: &[Value], index: usize) -> Result<bool, GatewayError> {
    args[index].as_bool().ok_or(GatewayError::InvalidArgument)
}

/// Numbers destined for integer parameters must be whole and fit the target.
pub fn arg_u32(args: &[Value], index: usize) -> Result<u32, GatewayError> {
    let number = arg_f64(args, index)?;
    if number.fract() != 0.0 || number < 0.0 || number > f64::from(u32::MAX) {
        return Err(GatewayError::InvalidArgument);
    }
    Ok(number as u32)
}

pub fn arg_usize(args: &[Value], index: usize) -> Result<usize, GatewayError> {
    let number = arg_f64(args, index)?;
    if number.fract() != 0.0 || number < 0.0 || number > u32::MAX as f64 {
        return Err(GatewayError::InvalidArgument);
    }
    Ok(number as usize)
}

pub fn arg_opt<'a>(args: &'a [Value], index: usize) -> Option<&'a Value> {
    args.get(index).filter(|v| !v.is_null())
}

pub fn number_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcRequest;

    const TABLE: &[MethodSpec] = &[
        method(
            "echo",
            &[
                required("text", ParamKind::String),
                optional("times", ParamKind::Number, ParamDefault::Number(1.0)),
            ],
        ),
        method("nop", &[]),
        placeholder("future", &[]),
    ];

    fn req(json: &str) -> RpcRequest {
        RpcRequest::parse_str(json).unwrap()
    }

    #[test]
    fn fills_defaults() {
        let d = dispatch(
            TABLE,
            &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["hi"]}"#),
            false,
        )
        .unwrap();
        assert_eq!(arg_str(&d.args, 0).unwrap(), "hi");
        assert_eq!(arg_u32(&d.args, 1).unwrap(), 1);
    }

    #[test]
    fn supports_named_params() {
        let d = dispatch(
            TABLE,
            &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"text":"hi","times":3}}"#),
            false,
        )
        .unwrap();
        assert_eq!(arg_u32(&d.args, 1).unwrap(), 3);
    }

    #[test]
    fn validates_arity_and_types() {
        assert_eq!(
            dispatch(
                TABLE,
                &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":[]}"#),
                false
            )
            .unwrap_err(),
            GatewayError::InvalidArgument
        );
        assert_eq!(
            dispatch(
                TABLE,
                &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":[3]}"#),
                false
            )
            .unwrap_err(),
            GatewayError::InvalidArgument
        );
        assert_eq!(
            dispatch(
                TABLE,
                &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["a","b","c"]}"#),
                false
            )
            .unwrap_err(),
            GatewayError::InvalidArgument
        );
    }

    #[test]
    fn tolerant_mode_ignores_extras() {
        let d = dispatch(
            TABLE,
            &req(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["a",2,"extra"]}"#),
            true,
        )
        .unwrap();
        assert_eq!(d.args.len(), 2);
    }

    #[test]
    fn unknown_and_unimplemented_methods() {
        assert_eq!(
            dispatch(TABLE, &req(r#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#), false)
                .unwrap_err(),
            GatewayError::MethodNotFound
        );
        assert_eq!(
            dispatch(TABLE, &req(r#"{"jsonrpc":"2.0","id":1,"method":"future"}"#), false)
                .unwrap_err(),
            GatewayError::NotImplemented
        );
    }

    #[test]
    fn rejects_non_finite_numbers() {
        // 1e999 parses as infinity under serde_json's default f64 handling
        let request = RpcRequest {
            version: crate::rpc::RpcVersion::V2,
            id: None,
            method: "echo".into(),
            params: crate::rpc::RpcParams::Positional(vec![json!("a"), json!(1.5)]),
        };
        // fractional numbers pass kind checking but fail integer coercion
        let d = dispatch(TABLE, &request, false).unwrap();
        assert_eq!(arg_u32(&d.args, 1).unwrap_err(), GatewayError::InvalidArgument);
    }
}

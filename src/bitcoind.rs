use std::sync::Arc;
use std::time::Instant;

use bitcoin_hashes::hex::ToHex;
use serde_json::Value;

use crate::dispatcher::{
    arg_bool, arg_str, arg_u32, arg_usize, dispatch, method, number_value, optional, placeholder,
    required, MethodSpec, ParamDefault, ParamKind,
};
use crate::error::{fmt_error_chain, gateway_error, GatewayError, Result};
use crate::estimator::{EstimateMode, Estimator, NO_ESTIMATE};
use crate::query::Query;
use crate::rpc::RpcRequest;

const BSG_VERSION: &str = env!("CARGO_PKG_VERSION");

const LT: &str = "bsg::bitcoind";

/// The advertised method set. Entries built with `placeholder` are declared
/// for compatibility and answer `not_implemented`; this table is the
/// authoritative list of what the endpoint speaks.
pub const METHODS: &[MethodSpec] = &[
    method("getbestblockhash", &[]),
    method(
        "getblock",
        &[
            required("blockhash", ParamKind::String),
            optional("verbosity", ParamKind::Number, ParamDefault::Number(1.0)),
        ],
    ),
    method("getblockchaininfo", &[]),
    method("getblockcount", &[]),
    method(
        "getblockfilter",
        &[
            required("blockhash", ParamKind::String),
            optional("filtertype", ParamKind::String, ParamDefault::Str("basic")),
        ],
    ),
    method("getblockhash", &[required("height", ParamKind::Number)]),
    method(
        "getblockheader",
        &[
            required("blockhash", ParamKind::String),
            optional("verbose", ParamKind::Boolean, ParamDefault::Bool(true)),
        ],
    ),
    placeholder(
        "getblockstats",
        &[
            required("hash_or_height", ParamKind::Any),
            optional("stats", ParamKind::Array, ParamDefault::EmptyArray),
        ],
    ),
    placeholder(
        "getchaintxstats",
        &[
            optional("nblocks", ParamKind::Number, ParamDefault::Number(-1.0)),
            optional("blockhash", ParamKind::String, ParamDefault::Str("")),
        ],
    ),
    method(
        "getrawtransaction",
        &[
            required("txid", ParamKind::String),
            optional("verbose", ParamKind::Boolean, ParamDefault::Bool(false)),
            optional("blockhash", ParamKind::String, ParamDefault::Null),
        ],
    ),
    placeholder(
        "gettxout",
        &[
            required("txid", ParamKind::String),
            required("n", ParamKind::Number),
            optional("include_mempool", ParamKind::Boolean, ParamDefault::Bool(true)),
        ],
    ),
    placeholder("gettxoutsetinfo", &[]),
    placeholder("pruneblockchain", &[required("height", ParamKind::Number)]),
    placeholder("savemempool", &[]),
    placeholder(
        "scantxoutset",
        &[
            required("action", ParamKind::String),
            optional("scanobjects", ParamKind::Array, ParamDefault::EmptyArray),
        ],
    ),
    placeholder(
        "verifychain",
        &[
            optional("checklevel", ParamKind::Number, ParamDefault::Number(4.0)),
            optional("nblocks", ParamKind::Number, ParamDefault::Number(288.0)),
        ],
    ),
    method(
        "sendrawtransaction",
        &[
            required("hexstring", ParamKind::String),
            optional("maxfeerate", ParamKind::Number, ParamDefault::Number(0.1)),
        ],
    ),
    method(
        "estimatesmartfee",
        &[
            required("conf_target", ParamKind::Number),
            optional("estimate_mode", ParamKind::String, ParamDefault::Str("unset")),
        ],
    ),
    method("getnetworkinfo", &[]),
    placeholder("getmininginfo", &[]),
    placeholder(
        "getblocktemplate",
        &[optional(
            "template_request",
            ParamKind::Object,
            ParamDefault::EmptyObject,
        )],
    ),
    placeholder(
        "submitblock",
        &[
            required("hexdata", ParamKind::String),
            optional("dummy", ParamKind::String, ParamDefault::Str("")),
        ],
    ),
    method("uptime", &[]),
];

pub struct BitcoindRpc {
    query: Arc<Query>,
    estimator: Arc<Estimator>,
    started: Instant,
}

impl BitcoindRpc {
    pub fn new(query: Arc<Query>, estimator: Arc<Estimator>) -> Self {
        BitcoindRpc {
            query,
            estimator,
            started: Instant::now(),
        }
    }

    /// Run one decoded request to completion, always yielding exactly one
    /// response value (the HTTP layer suppresses it for notifications).
    pub fn handle(&self, request: &RpcRequest) -> Value {
        debug!(target: LT, "rpc <- {}", request.method);

        // bitcoind tolerates and ignores extra trailing params
        let dispatched = match dispatch(METHODS, request, true) {
            Ok(dispatched) => dispatched,
            Err(e) => return request.response_gateway_err(e),
        };

        match self.call(request, &dispatched.args) {
            Ok(result) => request.response_ok(result),
            Err(e) => {
                warn!(target: LT, "rpc {} failed: {:?}", request.method, e);
                match gateway_error(&e) {
                    Some(cause) => request.response_gateway_err(cause),
                    None => request
                        .response_err(GatewayError::ServerError.rpc_code(), &fmt_error_chain(&e)),
                }
            }
        }
    }

    fn call(&self, request: &RpcRequest, args: &[Value]) -> Result<Value> {
        Ok(match request.method.as_str() {
            "getbestblockhash" => json!(self.query.get_tip()?.hash().to_string()),
            "getblockcount" => json!(self.query.get_tip_height()?),
            "getblockhash" => {
                let hash = self.query.get_block_hash(arg_u32(args, 0)?)?;
                json!(hash.to_string())
            }
            "getblockheader" => {
                let hash = parse_block_hash(arg_str(args, 0)?)?;
                if arg_bool(args, 1)? {
                    self.query.get_header_info(&hash)?
                } else {
                    json!(self.query.get_header_hex(&hash)?)
                }
            }
            "getblock" => {
                let hash = parse_block_hash(arg_str(args, 0)?)?;
                match arg_usize(args, 1)? {
                    0 => json!(self.query.get_block_raw(&hash)?.to_hex()),
                    _ => self.query.get_block_info(&hash)?,
                }
            }
            "getblockfilter" => {
                if arg_str(args, 1)? != "basic" {
                    bail!(GatewayError::NotImplemented);
                }
                let hash = parse_block_hash(arg_str(args, 0)?)?;
                self.query.get_block_filter(&hash)?
            }
            "getblockchaininfo" => self.query.get_blockchain_info()?,
            "getnetworkinfo" => {
                // the gateway fronts the node; do not leak its identity
                let relay_fee = self.query.relay_fee()?;
                json!({
                    "version": 0,
                    "subversion": format!("/bsg:{}/", BSG_VERSION),
                    "protocolversion": 70016,
                    "networkactive": true,
                    "connections": 0,
                    "relayfee": relay_fee / 100_000f64,
                    "warnings": "",
                })
            }
            "getrawtransaction" => {
                let txid = arg_str(args, 0)?
                    .parse()
                    .map_err(|_| GatewayError::InvalidHash)?;
                if arg_bool(args, 1)? {
                    self.query.get_tx_json(&txid)?
                } else {
                    json!(self.query.get_tx_hex(&txid)?)
                }
            }
            "sendrawtransaction" => {
                let txid = self.query.broadcast(arg_str(args, 0)?)?;
                json!(txid.to_string())
            }
            "estimatesmartfee" => {
                let target = arg_usize(args, 0)?;
                let mode: EstimateMode = arg_str(args, 1)?.parse()?;
                let rate = self.estimator.estimate(target, mode);
                if rate == NO_ESTIMATE {
                    json!({
                        "errors": ["Insufficient data or no feerate found"],
                        "blocks": target,
                    })
                } else {
                    json!({
                        // sat/vB to BTC/kvB
                        "feerate": number_value(rate as f64 / 100_000f64),
                        "blocks": target,
                    })
                }
            }
            "uptime" => json!(self.started.elapsed().as_secs()),
            other => {
                warn!(target: LT, "method {} in table but unrouted", other);
                bail!(GatewayError::NotImplemented);
            }
        })
    }
}

fn parse_block_hash(s: &str) -> Result<bitcoin::BlockHash> {
    Ok(s.parse().map_err(|_| GatewayError::InvalidHash)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcRequest;

    #[test]
    fn placeholders_answer_not_implemented() {
        let request = RpcRequest::parse_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"gettxoutsetinfo","params":[]}"#,
        )
        .unwrap();
        let err = dispatch(METHODS, &request, true).unwrap_err();
        assert_eq!(err, GatewayError::NotImplemented);
    }

    #[test]
    fn unknown_methods_are_method_not_found() {
        let request =
            RpcRequest::parse_str(r#"{"jsonrpc":"2.0","id":1,"method":"walletpassphrase"}"#)
                .unwrap();
        assert_eq!(
            dispatch(METHODS, &request, true).unwrap_err(),
            GatewayError::MethodNotFound
        );
    }

    #[test]
    fn extra_trailing_params_are_tolerated() {
        let request = RpcRequest::parse_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"getblockcount","params":["bogus"]}"#,
        )
        .unwrap();
        assert!(dispatch(METHODS, &request, true).is_ok());
    }

    #[test]
    fn the_implemented_prefix_is_declared() {
        for name in &[
            "getbestblockhash",
            "getblockcount",
            "getblockhash",
            "getblockheader",
            "getblock",
            "getblockchaininfo",
            "getrawtransaction",
            "sendrawtransaction",
            "estimatesmartfee",
            "getnetworkinfo",
            "uptime",
        ] {
            let spec = METHODS.iter().find(|m| m.name == *name);
            assert!(spec.map_or(false, |m| m.implemented), "missing {}", name);
        }
    }
}

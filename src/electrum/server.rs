use std::cmp;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use bitcoin::Txid;
use bitcoin_hashes::hex::{FromHex, ToHex};
use bitcoin_hashes::Hash;
use serde_json::Value;

use crate::channel::{read_line_capped, Channel, ChannelState, LINE_LIMIT};
use crate::dispatcher::{
    arg_bool, arg_opt, arg_str, arg_u32, arg_usize, dispatch, method, optional, required,
    MethodSpec, ParamDefault, ParamKind,
};
use crate::electrum::{
    electrum_height, make_fee_histogram, negotiate_version, sanitize_client_name, ElectrumVersion,
    QueryExt, PROTOCOL_MAX, PROTOCOL_MIN,
};
use crate::error::{fmt_error_chain, gateway_error, GatewayError, Result};
use crate::estimator::{EstimateMode, Estimator, NO_ESTIMATE};
use crate::notifier::{Notification, Notifier, NotifySink, Route, SinkError, SubscriptionKind};
use crate::query::Query;
use crate::rpc::{rpc_notification, RpcId, RpcParams, RpcRequest, RpcVersion};
use crate::session::{Session, SessionOptions};
use crate::types::{Binary, ScriptHash};
use crate::util::{spawn_thread, ShutdownToken, SyncChannel};

const BSG_VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_HEADERS: u32 = 2016;

const LT: &str = "bsg::electrum"; // log target name

const METHODS: &[MethodSpec] = &[
    method(
        "blockchain.block.header",
        &[
            required("height", ParamKind::Number),
            optional("cp_height", ParamKind::Number, ParamDefault::Null),
        ],
    ),
    method(
        "blockchain.block.headers",
        &[
            required("start_height", ParamKind::Number),
            required("count", ParamKind::Number),
            optional("cp_height", ParamKind::Number, ParamDefault::Null),
        ],
    ),
    method("blockchain.headers.subscribe", &[]),
    method(
        "blockchain.estimatefee",
        &[
            required("number", ParamKind::Number),
            optional("mode", ParamKind::String, ParamDefault::Str("")),
        ],
    ),
    method("blockchain.relayfee", &[]),
    method(
        "blockchain.scripthash.get_balance",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.scripthash.get_history",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.scripthash.get_mempool",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.scripthash.listunspent",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.scripthash.subscribe",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.scripthash.unsubscribe",
        &[required("scripthash", ParamKind::String)],
    ),
    method(
        "blockchain.transaction.broadcast",
        &[required("raw_tx", ParamKind::String)],
    ),
    method(
        "blockchain.transaction.get",
        &[
            required("tx_hash", ParamKind::String),
            optional("verbose", ParamKind::Boolean, ParamDefault::Bool(false)),
        ],
    ),
    method(
        "blockchain.transaction.get_merkle",
        &[
            required("tx_hash", ParamKind::String),
            required("height", ParamKind::Number),
        ],
    ),
    method(
        "blockchain.transaction.id_from_pos",
        &[
            required("height", ParamKind::Number),
            required("tx_pos", ParamKind::Number),
            optional("merkle", ParamKind::Boolean, ParamDefault::Bool(false)),
        ],
    ),
    method("server.add_peer", &[required("features", ParamKind::Object)]),
    method("server.banner", &[]),
    method("server.donation_address", &[]),
    method("server.features", &[]),
    method("server.peers.subscribe", &[]),
    method("server.ping", &[]),
    method(
        "server.version",
        &[
            required("client_name", ParamKind::String),
            optional("protocol_version", ParamKind::Any, ParamDefault::Null),
        ],
    ),
    method("mempool.get_fee_histogram", &[]),
];

#[derive(Debug)]
enum Message {
    Request(String),
    Notify(Notification),
    Done,
}

/// The notifier's write handle into one electrum connection.
struct ConnectionSink(SyncSender<Message>);

impl NotifySink for ConnectionSink {
    fn notify(&self, notification: &Notification) -> std::result::Result<(), SinkError> {
        match self.0.try_send(Message::Notify(notification.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Overflow),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Closed),
        }
    }
}

struct Connection {
    query: Arc<Query>,
    estimator: Arc<Estimator>,
    notifier: Arc<Notifier>,
    channel: Arc<Channel>,
    chan: SyncChannel<Message>,
    /// Set by the first successful `server.version`; later calls ignored.
    negotiated: Option<ElectrumVersion>,
    client: String,
    donation_address: Option<String>,
}

impl Connection {
    fn new(
        query: Arc<Query>,
        estimator: Arc<Estimator>,
        notifier: Arc<Notifier>,
        channel: Arc<Channel>,
        donation_address: Option<String>,
    ) -> Connection {
        Connection {
            query,
            estimator,
            notifier,
            channel,
            chan: SyncChannel::new(10),
            negotiated: None,
            client: String::new(),
            donation_address,
        }
    }

    fn route(&self) -> Route {
        Route::new(
            self.channel.id(),
            Arc::new(ConnectionSink(self.chan.sender())),
        )
    }

    // Handshake.
    // ------------------------------------------------------------------------

    fn server_version(&mut self, args: &[Value]) -> Result<Value> {
        if self.negotiated.is_none() {
            let client = sanitize_client_name(arg_str(args, 0)?)?;
            let version = negotiate_version(&args[1])?;
            info!(
                target: LT,
                "[{}] electrum client {:?} version {}",
                self.channel.addr(),
                client,
                version
            );
            self.client = client;
            self.negotiated = Some(version);
            self.channel.transition(ChannelState::Ready);
        }
        // a repeat server.version reports the negotiated state unchanged
        let version = self.negotiated.expect("negotiated above");
        Ok(json!([format!("bsg {}", BSG_VERSION), version.to_string()]))
    }

    // Blockchain methods.
    // ------------------------------------------------------------------------

    fn blockchain_block_header(&self, args: &[Value]) -> Result<Value> {
        let height = arg_u32(args, 0)?;
        let header_hex = self.query.get_header(height)?;

        Ok(match arg_opt(args, 1) {
            Some(_) => {
                let cp_height = arg_u32(args, 1)?;
                let (branch, root) = self.query.electrum_header_merkle_proof(height, cp_height)?;
                json!({
                    "header": header_hex,
                    "root": root.to_hex(),
                    "branch": map_str(branch),
                })
            }
            None => json!(header_hex),
        })
    }

    fn blockchain_block_headers(&self, args: &[Value]) -> Result<Value> {
        let start_height = arg_u32(args, 0)?;
        let count = cmp::min(arg_u32(args, 1)?, MAX_HEADERS);

        // only return the available headers when the chain is shorter
        let tip_height = self.query.get_tip_height()?;
        let heights: Vec<u32> = if count == 0 {
            vec![]
        } else {
            let max_height = cmp::min(start_height + (count - 1), tip_height);
            (start_height..=max_height).collect()
        };
        let headers = self.query.get_headers(&heights)?;

        let mut result = json!({
            "count": headers.len(),
            "hex": headers.join(""),
            "max": MAX_HEADERS,
        });

        if count > 0 {
            if arg_opt(args, 2).is_some() {
                let cp_height = arg_u32(args, 2)?;
                let (branch, root) = self
                    .query
                    .electrum_header_merkle_proof(start_height + (count - 1), cp_height)?;
                result["root"] = json!(root.to_hex());
                result["branch"] = json!(map_str(branch));
            }
        }

        Ok(result)
    }

    fn blockchain_headers_subscribe(&mut self) -> Result<Value> {
        self.notifier
            .subscribe(self.route(), SubscriptionKind::Header, Binary::empty())?;

        let tip = self.query.get_tip()?;
        let tip_hex = self.query.get_header_hex(&tip.hash())?;
        Ok(json!({ "height": tip.height(), "hex": tip_hex }))
    }

    fn blockchain_estimatefee(&self, args: &[Value]) -> Result<Value> {
        let target = arg_usize(args, 0)?;
        let mode: EstimateMode = arg_str(args, 1)?.parse()?;
        let rate = self.estimator.estimate(target, mode);

        // electrum wants BTC/kvB, -1 when no estimate is available
        Ok(json!(if rate == NO_ESTIMATE {
            -1.0
        } else {
            rate as f64 / 100_000f64
        }))
    }

    fn blockchain_relayfee(&self) -> Result<Value> {
        let rate = self.query.relay_fee()?;
        // sat/vb to BTC/kvB
        Ok(json!(rate / 100_000f64))
    }

    fn blockchain_scripthash_subscribe(&mut self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        self.notifier.subscribe(
            self.route(),
            SubscriptionKind::ScriptHashStatus,
            Binary::from_script_hash(&scripthash),
        )?;

        Ok(json!(self.query.get_status_hash(&scripthash)))
    }

    fn blockchain_scripthash_unsubscribe(&mut self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        let existed = self.notifier.unsubscribe(
            self.channel.id(),
            SubscriptionKind::ScriptHashStatus,
            Binary::from_script_hash(&scripthash),
        );
        Ok(json!(existed))
    }

    fn blockchain_scripthash_get_balance(&self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        let (confirmed, unconfirmed) = self.query.get_script_balance(&scripthash);
        Ok(json!({
            "confirmed": confirmed,
            "unconfirmed": unconfirmed,
        }))
    }

    fn blockchain_scripthash_get_history(&self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        let txs: Vec<Value> = self.query.map_history(&scripthash, |hist| {
            json!({
                "height": electrum_height(hist.status, None),
                "tx_hash": hist.txid,
            })
        });
        Ok(json!(txs))
    }

    fn blockchain_scripthash_get_mempool(&self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        let txs: Vec<Value> = self
            .query
            .get_history(&scripthash)
            .into_iter()
            .filter(|hist| hist.status.is_unconfirmed())
            .map(|hist| {
                json!({
                    "height": electrum_height(hist.status, None),
                    "tx_hash": hist.txid,
                })
            })
            .collect();
        Ok(json!(txs))
    }

    fn blockchain_scripthash_listunspent(&self, args: &[Value]) -> Result<Value> {
        let scripthash = decode_script_hash(arg_str(args, 0)?)?;
        let utxos: Vec<Value> = self
            .query
            .list_unspent(&scripthash)
            .into_iter()
            .map(|utxo| {
                json!({
                    "height": electrum_height(utxo.status, None),
                    "tx_hash": utxo.txid,
                    "tx_pos": utxo.vout,
                    "value": utxo.value,
                })
            })
            .collect();
        Ok(json!(utxos))
    }

    fn blockchain_transaction_broadcast(&self, args: &[Value]) -> Result<Value> {
        let txid = self.query.broadcast(arg_str(args, 0)?)?;
        Ok(json!(txid.to_string()))
    }

    fn blockchain_transaction_get(&self, args: &[Value]) -> Result<Value> {
        let txid = parse_txid(arg_str(args, 0)?)?;
        Ok(if arg_bool(args, 1)? {
            self.query.get_tx_json(&txid)?
        } else {
            json!(self.query.get_tx_hex(&txid)?)
        })
    }

    fn blockchain_transaction_get_merkle(&self, args: &[Value]) -> Result<Value> {
        let txid = parse_txid(arg_str(args, 0)?)?;
        let height = arg_u32(args, 1)?;
        let (merkle, pos) = self.query.electrum_merkle_proof(&txid, height)?;

        Ok(json!({
            "block_height": height,
            "merkle": map_str(merkle),
            "pos": pos,
        }))
    }

    fn blockchain_transaction_id_from_pos(&self, args: &[Value]) -> Result<Value> {
        let height = arg_u32(args, 0)?;
        let tx_pos = arg_usize(args, 1)?;
        let want_merkle = arg_bool(args, 2)?;

        let (txid, merkle) = self.query.electrum_id_from_pos(height, tx_pos, want_merkle)?;

        Ok(if !want_merkle {
            json!(txid.to_string())
        } else {
            json!({
                "tx_hash": txid,
                "merkle": map_str(merkle),
            })
        })
    }

    // Server methods.
    // ------------------------------------------------------------------------

    fn server_banner(&self) -> Result<Value> {
        Ok(json!(format!(
            "Welcome to bsg {}, a gateway to the Bitcoin network.",
            BSG_VERSION
        )))
    }

    fn server_donation_address(&self) -> Result<Value> {
        Ok(json!(self.donation_address))
    }

    fn server_features(&self) -> Result<Value> {
        let genesis = self.query.get_block_hash(0)?;
        Ok(json!({
            "server_version": format!("bsg {}", BSG_VERSION),
            "genesis_hash": genesis.to_string(),
            "protocol_min": PROTOCOL_MIN.to_string(),
            "protocol_max": PROTOCOL_MAX.to_string(),
            "hash_function": "sha256",
            "hosts": {},
            "pruning": Value::Null,
        }))
    }

    fn server_add_peer(&self) -> Result<Value> {
        // peer discovery is not offered
        Ok(json!(false))
    }

    fn server_peers_subscribe(&self) -> Result<Value> {
        Ok(json!([]))
    }

    fn mempool_get_fee_histogram(&self) -> Result<Value> {
        let histogram = make_fee_histogram(&self.query.get_raw_mempool()?)?;
        Ok(json!(histogram))
    }

    // Dispatch.
    // ------------------------------------------------------------------------

    fn handle_request(&mut self, request: &RpcRequest) -> Value {
        match request.method.as_str() {
            "server.ping" | "blockchain.scripthash.subscribe" | "blockchain.estimatefee"
            | "mempool.get_fee_histogram" => {
                trace!(target: LT, "rpc <- {}", request.method);
            }
            _ => {
                debug!(target: LT, "rpc <- {}", request.method);
            }
        }

        // changed in electrum 1.6: extraneous args are tolerated and ignored
        let dispatched = match dispatch(&METHODS, request, true) {
            Ok(dispatched) => dispatched,
            Err(e) => return request.response_gateway_err(e),
        };
        let args = &dispatched.args;

        let result = match request.method.as_str() {
            "blockchain.block.header" => self.blockchain_block_header(args),
            "blockchain.block.headers" => self.blockchain_block_headers(args),
            "blockchain.estimatefee" => self.blockchain_estimatefee(args),
            "blockchain.headers.subscribe" => self.blockchain_headers_subscribe(),
            "blockchain.relayfee" => self.blockchain_relayfee(),
            "blockchain.scripthash.get_balance" => self.blockchain_scripthash_get_balance(args),
            "blockchain.scripthash.get_history" => self.blockchain_scripthash_get_history(args),
            "blockchain.scripthash.get_mempool" => self.blockchain_scripthash_get_mempool(args),
            "blockchain.scripthash.listunspent" => self.blockchain_scripthash_listunspent(args),
            "blockchain.scripthash.subscribe" => self.blockchain_scripthash_subscribe(args),
            "blockchain.scripthash.unsubscribe" => self.blockchain_scripthash_unsubscribe(args),
            "blockchain.transaction.broadcast" => self.blockchain_transaction_broadcast(args),
            "blockchain.transaction.get" => self.blockchain_transaction_get(args),
            "blockchain.transaction.get_merkle" => self.blockchain_transaction_get_merkle(args),
            "blockchain.transaction.id_from_pos" => self.blockchain_transaction_id_from_pos(args),
            "mempool.get_fee_histogram" => self.mempool_get_fee_histogram(),
            "server.add_peer" => self.server_add_peer(),
            "server.banner" => self.server_banner(),
            "server.donation_address" => self.server_donation_address(),
            "server.features" => self.server_features(),
            "server.peers.subscribe" => self.server_peers_subscribe(),
            "server.ping" => Ok(Value::Null),
            "server.version" => self.server_version(args),
            other => {
                warn!(target: LT, "method {} in table but unrouted", other);
                Err(GatewayError::MethodNotFound.into())
            }
        };

        match result {
            Ok(result) => {
                trace!(target: LT, "rpc -> {} {}", request.method, result);
                request.response_ok(result)
            }
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

    fn make_notification(&self, notification: &Notification) -> Result<Option<Value>> {
        if notification.code != 0 {
            // lease expiry / engine shutdown have no electrum representation
            trace!(
                target: LT,
                "[{}] dropping code {} notification",
                self.channel.addr(),
                notification.code
            );
            return Ok(None);
        }
        Ok(match notification.kind {
            SubscriptionKind::Header => {
                let hex_header = self.query.get_header_hex(&notification.block_hash)?;
                Some(rpc_notification(
                    "blockchain.headers.subscribe",
                    json!([{ "hex": hex_header, "height": notification.height }]),
                ))
            }
            SubscriptionKind::ScriptHashStatus => {
                let scripthash = ScriptHash::from_slice(notification.selector.bytes())?;
                let status_hash = self.query.get_status_hash(&scripthash);
                Some(rpc_notification(
                    "blockchain.scripthash.subscribe",
                    json!([encode_script_hash(&scripthash), status_hash]),
                ))
            }
            _ => None,
        })
    }

    fn send_value(&self, value: &Value) -> Result<()> {
        self.channel.send_line(value.to_string())?;
        Ok(())
    }

    fn handle_replies(&mut self) -> Result<()> {
        loop {
            let msg = match self.chan.receiver().recv() {
                Ok(msg) => msg,
                Err(_) => return Ok(()),
            };
            match msg {
                Message::Request(line) => {
                    let request = match RpcRequest::parse_str(&line) {
                        Ok(request) => request,
                        Err(e) => {
                            let poison = RpcRequest {
                                version: RpcVersion::V2,
                                id: Some(RpcId::Null),
                                method: String::new(),
                                params: RpcParams::None,
                            };
                            let _ = self.send_value(&poison.response_gateway_err(e));
                            bail!(e);
                        }
                    };
                    let is_notification = request.is_notification();
                    let reply = self.handle_request(&request);
                    if !is_notification {
                        self.send_value(&reply)?;
                    }
                }
                Message::Notify(notification) => {
                    if let Some(value) = self.make_notification(&notification)? {
                        debug!(target: LT, "sending notification {}", value["method"]);
                        self.send_value(&value)?;
                    }
                }
                Message::Done => return Ok(()),
            }
        }
    }

    fn handle_requests(
        stream: TcpStream,
        tx: SyncSender<Message>,
        shutdown: ShutdownToken,
    ) -> Result<()> {
        let mut reader = BufReader::new(stream);
        loop {
            if shutdown.is_signaled() {
                let _ = tx.send(Message::Done);
                return Ok(());
            }
            match read_line_capped(&mut reader, LINE_LIMIT) {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => tx
                    .send(Message::Request(line))
                    .map_err(|_| GatewayError::ChannelStopped)?,
                Ok(None) => {
                    let _ = tx.send(Message::Done);
                    return Ok(());
                }
                Err(e) => {
                    let _ = tx.send(Message::Done);
                    bail!(e);
                }
            }
        }
    }

    pub fn run(mut self, stream: TcpStream, shutdown: ShutdownToken) {
        self.channel.transition(ChannelState::Handshaking);

        let tx = self.chan.sender();
        let reader_channel = Arc::clone(&self.channel);
        let child = spawn_thread("electrum-reader", move || {
            let result = Connection::handle_requests(stream, tx, shutdown);
            reader_channel.close();
            result
        });

        if let Err(e) = self.handle_replies() {
            warn!(
                target: LT,
                "[{}] handling failed: {}",
                self.channel.addr(),
                fmt_error_chain(&e)
            );
        }

        trace!(target: LT, "[{}] shutting down connection", self.channel.addr());
        self.channel.close();
        self.notifier.unsubscribe_route(self.channel.id());
        if let Err(e) = child.join().expect("reader panicked") {
            trace!(
                target: LT,
                "[{}] reader closed: {}",
                self.channel.addr(),
                fmt_error_chain(&e)
            );
        }
    }
}

fn map_str<T>(items: Vec<T>) -> Vec<String>
where
    T: ToString,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

fn parse_txid(s: &str) -> Result<Txid> {
    Ok(s.parse().map_err(|_| GatewayError::InvalidHash)?)
}

/// Electrum displays script hashes in reversed byte order.
pub fn encode_script_hash(hash: &ScriptHash) -> String {
    reverse_hash(*hash).to_hex()
}

pub fn decode_script_hash(s: &str) -> Result<ScriptHash> {
    Ok(reverse_hash(
        ScriptHash::from_hex(s).map_err(|_| GatewayError::InvalidHash)?,
    ))
}

fn reverse_hash(hash: ScriptHash) -> ScriptHash {
    let mut inner = hash.into_inner();
    inner.reverse();
    ScriptHash::from_slice(&inner).unwrap()
}

pub struct ElectrumServer {
    session: Arc<Session>,
}

impl ElectrumServer {
    pub fn start(
        options: SessionOptions,
        query: Arc<Query>,
        estimator: Arc<Estimator>,
        notifier: Arc<Notifier>,
        shutdown: ShutdownToken,
        donation_address: Option<String>,
    ) -> Result<Self> {
        let serve_shutdown = shutdown.clone();
        let session = Session::start("electrum", options, shutdown, move |channel, stream| {
            let conn = Connection::new(
                Arc::clone(&query),
                Arc::clone(&estimator),
                Arc::clone(&notifier),
                channel,
                donation_address.clone(),
            );
            conn.run(stream, serve_shutdown.clone());
        })?;

        info!(
            target: LT,
            "Electrum RPC server running (protocol {}..{})", PROTOCOL_MIN, PROTOCOL_MAX
        );

        Ok(ElectrumServer {
            session: Arc::new(session),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_hash_codec_round_trips() {
        let display = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";
        let decoded = decode_script_hash(display).unwrap();
        assert_eq!(encode_script_hash(&decoded), display);
    }

    #[test]
    fn bad_script_hash_is_invalid_hash() {
        let err = decode_script_hash("zz").unwrap_err();
        assert_eq!(gateway_error(&err), Some(GatewayError::InvalidHash));
    }

    #[test]
    fn method_table_covers_the_protocol() {
        for name in &[
            "blockchain.block.header",
            "blockchain.headers.subscribe",
            "blockchain.scripthash.subscribe",
            "blockchain.scripthash.unsubscribe",
            "blockchain.transaction.get",
            "server.version",
            "mempool.get_fee_histogram",
        ] {
            assert!(METHODS.iter().any(|m| m.name == *name), "missing {}", name);
        }
    }
}

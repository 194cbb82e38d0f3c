use std::collections::VecDeque;
use std::io::{BufReader, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use bitcoin_hashes::hex::{FromHex, ToHex};
use bitcoin_hashes::{sha256d, Hash};
use rand::Rng;
use serde_json::Value;

use crate::channel::{read_line_capped, Channel, ChannelState, LINE_LIMIT};
use crate::dispatcher::{arg_str, dispatch, method, optional, required, MethodSpec, ParamDefault, ParamKind};
use crate::electrum::create_merkle_branch_and_root;
use crate::error::{fmt_error_chain, gateway_error, GatewayError, Result};
use crate::notifier::{Notification, Notifier, NotifySink, Route, SinkError, SubscriptionKind};
use crate::query::Query;
use crate::rpc::RpcRequest;
use crate::session::{Session, SessionOptions};
use crate::types::Binary;
use crate::util::{spawn_thread, ShutdownToken, SyncChannel};

const LT: &str = "bsg::stratum";

const EXTRANONCE2_SIZE: usize = 4;
const DEFAULT_DIFFICULTY: f64 = 1.0;
const RECENT_JOBS: usize = 4;

// Stratum v1 error codes.
const ERR_OTHER: i64 = 20;
const ERR_JOB_NOT_FOUND: i64 = 21;
const ERR_UNAUTHORIZED: i64 = 24;

const METHODS: &[MethodSpec] = &[
    method(
        "mining.subscribe",
        &[
            optional("user_agent", ParamKind::String, ParamDefault::Str("")),
            optional("session_id", ParamKind::String, ParamDefault::Null),
        ],
    ),
    method(
        "mining.authorize",
        &[
            required("username", ParamKind::String),
            optional("password", ParamKind::String, ParamDefault::Str("")),
        ],
    ),
    method(
        "mining.submit",
        &[
            required("username", ParamKind::String),
            required("job_id", ParamKind::String),
            required("extranonce2", ParamKind::String),
            required("ntime", ParamKind::String),
            required("nonce", ParamKind::String),
        ],
    ),
    method("mining.configure", &[
        optional("extensions", ParamKind::Array, ParamDefault::EmptyArray),
        optional("extension_parameters", ParamKind::Object, ParamDefault::EmptyObject),
    ]),
];

static JOB_COUNTER: AtomicU64 = AtomicU64::new(1);

// Mining jobs.
// ----------------------------------------------------------------------------

/// One `mining.notify` payload derived from a block template.
#[derive(Clone, Debug)]
pub struct MiningJob {
    pub id: String,
    pub prevhash: String,
    pub coinb1: String,
    pub coinb2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean: bool,
}

impl MiningJob {
    pub fn notify_params(&self) -> Value {
        json!([
            self.id,
            self.prevhash,
            self.coinb1,
            self.coinb2,
            self.merkle_branch,
            self.version,
            self.nbits,
            self.ntime,
            self.clean,
        ])
    }
}

/// Stratum transmits the previous block hash as eight byte-swapped 32 bit
/// words of the internal encoding.
fn stratum_prevhash(hash_hex: &str) -> Result<String> {
    let mut bytes = Vec::<u8>::from_hex(hash_hex).map_err(|_| GatewayError::InvalidHash)?;
    if bytes.len() != 32 {
        bail!(GatewayError::InvalidHash);
    }
    bytes.reverse(); // display order to internal order
    let mut out = Vec::with_capacity(32);
    for word in bytes.chunks(4) {
        out.extend(word.iter().rev());
    }
    Ok(out.to_hex())
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend(&(value as u16).to_le_bytes());
        }
        _ => {
            out.push(0xfe);
            out.extend(&(value as u32).to_le_bytes());
        }
    }
}

/// A minimal height-committing coinbase split around the extranonce bytes.
fn build_coinbase_halves(height: u32, value: u64, extranonce_len: usize) -> (Vec<u8>, Vec<u8>) {
    // BIP34 minimal height push
    let mut height_bytes = height.to_le_bytes().to_vec();
    while height_bytes.len() > 1 && *height_bytes.last().unwrap() == 0 {
        height_bytes.pop();
    }

    let tag = b"/bsg/";
    let script_len = 1 + height_bytes.len() + tag.len() + extranonce_len;

    let mut coinb1 = Vec::new();
    coinb1.extend(&1u32.to_le_bytes()); // tx version
    coinb1.push(1); // one input
    coinb1.extend(&[0u8; 32]); // null prevout hash
    coinb1.extend(&0xffff_ffffu32.to_le_bytes()); // null prevout index
    push_varint(&mut coinb1, script_len as u64);
    coinb1.push(height_bytes.len() as u8);
    coinb1.extend(&height_bytes);
    coinb1.extend(tag);
    // extranonce1 + extranonce2 are spliced in here by the miner

    let mut coinb2 = Vec::new();
    coinb2.extend(&0xffff_ffffu32.to_le_bytes()); // sequence
    coinb2.push(1); // one output
    coinb2.extend(&value.to_le_bytes());
    coinb2.extend(&[0x01, 0x51]); // anyone-can-spend placeholder script
    coinb2.extend(&0u32.to_le_bytes()); // locktime

    (coinb1, coinb2)
}

/// Turn a `getblocktemplate` reply into a `mining.notify` job.
pub fn job_from_template(template: &Value, clean: bool) -> Result<MiningJob> {
    let prevhash = template["previousblockhash"]
        .as_str()
        .ok_or(GatewayError::BadStream)?;
    let height = template["height"].as_u64().ok_or(GatewayError::BadStream)? as u32;
    let value = template["coinbasevalue"].as_u64().unwrap_or(0);
    let version = template["version"].as_u64().ok_or(GatewayError::BadStream)? as u32;
    let bits = template["bits"].as_str().ok_or(GatewayError::BadStream)?;
    let time = template["curtime"].as_u64().ok_or(GatewayError::BadStream)? as u32;

    // sibling chain for the coinbase at position zero; the placeholder value
    // never lands in the branch
    let mut hashes = vec![sha256d::Hash::default()];
    if let Some(txs) = template["transactions"].as_array() {
        for tx in txs {
            let txid = tx["txid"].as_str().or_else(|| tx["hash"].as_str());
            let txid = txid.ok_or(GatewayError::BadStream)?;
            let mut bytes = Vec::<u8>::from_hex(txid).map_err(|_| GatewayError::InvalidHash)?;
            bytes.reverse();
            hashes.push(sha256d::Hash::from_slice(&bytes)?);
        }
    }
    let merkle_branch = if hashes.len() > 1 {
        create_merkle_branch_and_root(hashes, 0)
            .0
            .into_iter()
            .map(|h| h.into_inner().to_hex())
            .collect()
    } else {
        vec![]
    };

    let (coinb1, coinb2) =
        build_coinbase_halves(height, value, EXTRANONCE2_SIZE + EXTRANONCE2_SIZE);

    Ok(MiningJob {
        id: format!("{:x}", JOB_COUNTER.fetch_add(1, Ordering::Relaxed)),
        prevhash: stratum_prevhash(prevhash)?,
        coinb1: coinb1.to_hex(),
        coinb2: coinb2.to_hex(),
        merkle_branch,
        version: format!("{:08x}", version),
        nbits: bits.into(),
        ntime: format!("{:08x}", time),
        clean,
    })
}

// Stratum v1 connection.
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Message {
    Request(String),
    Notify(Notification),
    Done,
}

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
    notifier: Arc<Notifier>,
    channel: Arc<Channel>,
    chan: SyncChannel<Message>,
    extranonce1: String,
    subscribed: bool,
    authorized: Option<String>,
    recent_jobs: VecDeque<String>,
}

impl Connection {
    fn new(query: Arc<Query>, notifier: Arc<Notifier>, channel: Arc<Channel>) -> Connection {
        let extranonce1: u32 = rand::thread_rng().gen();
        Connection {
            query,
            notifier,
            channel,
            chan: SyncChannel::new(10),
            extranonce1: format!("{:08x}", extranonce1),
            subscribed: false,
            authorized: None,
            recent_jobs: VecDeque::new(),
        }
    }

    fn route(&self) -> Route {
        Route::new(
            self.channel.id(),
            Arc::new(ConnectionSink(self.chan.sender())),
        )
    }

    fn send_value(&self, value: &Value) -> Result<()> {
        self.channel.send_line(value.to_string())?;
        Ok(())
    }

    fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.send_value(&json!({ "id": Value::Null, "method": method, "params": params }))
    }

    fn send_job(&mut self, clean: bool) -> Result<()> {
        let template = self.query.get_block_template()?;
        let job = job_from_template(&template, clean)?;
        self.recent_jobs.push_back(job.id.clone());
        while self.recent_jobs.len() > RECENT_JOBS {
            self.recent_jobs.pop_front();
        }
        self.send_notification("mining.notify", job.notify_params())
    }

    fn mining_subscribe(&mut self, args: &[Value]) -> Result<Value> {
        let agent = arg_str(args, 0)?;
        if !agent.is_empty() {
            debug!(target: LT, "[{}] miner {}", self.channel.addr(), agent);
        }
        self.subscribed = true;
        self.notifier
            .subscribe(self.route(), SubscriptionKind::MiningJob, Binary::empty())?;
        self.channel.transition(ChannelState::Ready);

        let subscription_id = format!("{:016x}", self.channel.id());
        Ok(json!([
            [
                ["mining.set_difficulty", subscription_id],
                ["mining.notify", subscription_id],
            ],
            self.extranonce1,
            EXTRANONCE2_SIZE,
        ]))
    }

    fn mining_authorize(&mut self, args: &[Value]) -> Result<Value> {
        let username = arg_str(args, 0)?;
        info!(target: LT, "[{}] authorized {}", self.channel.addr(), username);
        self.authorized = Some(username.to_string());
        Ok(json!(true))
    }

    fn mining_submit(&mut self, args: &[Value]) -> std::result::Result<Value, (i64, &'static str)> {
        if self.authorized.is_none() {
            return Err((ERR_UNAUTHORIZED, "unauthorized worker"));
        }
        let job_id = arg_str(args, 1).map_err(|_| (ERR_OTHER, "malformed submit"))?;
        if !self.recent_jobs.iter().any(|id| id == job_id) {
            return Err((ERR_JOB_NOT_FOUND, "job not found"));
        }
        let extranonce2 = arg_str(args, 2).map_err(|_| (ERR_OTHER, "malformed submit"))?;
        if Vec::<u8>::from_hex(extranonce2).map(|b| b.len()) != Ok(EXTRANONCE2_SIZE) {
            return Err((ERR_OTHER, "bad extranonce2"));
        }
        // share difficulty accounting is the pool's business, not the
        // gateway's; a well-formed submission for a live job is accepted
        trace!(target: LT, "[{}] share for job {}", self.channel.addr(), job_id);
        Ok(json!(true))
    }

    fn handle_request(&mut self, request: &RpcRequest) -> Value {
        let dispatched = match dispatch(METHODS, request, true) {
            Ok(dispatched) => dispatched,
            Err(GatewayError::MethodNotFound) => {
                return stratum_error(request, ERR_OTHER, "unknown method")
            }
            Err(_) => return stratum_error(request, ERR_OTHER, "malformed request"),
        };
        let args = &dispatched.args;

        match request.method.as_str() {
            "mining.subscribe" => match self.mining_subscribe(args) {
                Ok(result) => request.response_ok(result),
                Err(e) => {
                    warn!(target: LT, "subscribe failed: {}", fmt_error_chain(&e));
                    let message = match gateway_error(&e) {
                        Some(GatewayError::PoolFilled) => "subscription pool filled",
                        _ => "subscribe failed",
                    };
                    stratum_error(request, ERR_OTHER, message)
                }
            },
            "mining.authorize" => match self.mining_authorize(args) {
                Ok(result) => request.response_ok(result),
                Err(_) => stratum_error(request, ERR_OTHER, "authorize failed"),
            },
            "mining.submit" => match self.mining_submit(args) {
                Ok(result) => request.response_ok(result),
                Err((code, message)) => stratum_error(request, code, message),
            },
            "mining.configure" => request.response_ok(json!({})),
            _ => stratum_error(request, ERR_OTHER, "unknown method"),
        }
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
                        Err(e) => bail!(e),
                    };
                    let reply = self.handle_request(&request);
                    if !request.is_notification() {
                        self.send_value(&reply)?;
                    }
                    // the initial job follows the subscription response
                    if request.method == "mining.subscribe" && self.subscribed {
                        self.send_notification(
                            "mining.set_difficulty",
                            json!([DEFAULT_DIFFICULTY]),
                        )?;
                        if let Err(e) = self.send_job(true) {
                            warn!(target: LT, "initial job failed: {}", fmt_error_chain(&e));
                        }
                    }
                }
                Message::Notify(notification) => {
                    if notification.code != 0 {
                        continue;
                    }
                    if notification.kind == SubscriptionKind::MiningJob && self.subscribed {
                        if let Err(e) = self.send_job(true) {
                            warn!(target: LT, "job push failed: {}", fmt_error_chain(&e));
                        }
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

    fn run(mut self, stream: TcpStream, shutdown: ShutdownToken) {
        self.channel.transition(ChannelState::Handshaking);

        let tx = self.chan.sender();
        let reader_channel = Arc::clone(&self.channel);
        let child = spawn_thread("stratum-reader", move || {
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

        // ask well-behaved miners to move on before the socket drops
        let _ = self.send_notification("client.reconnect", json!([]));
        self.channel.close();
        self.notifier.unsubscribe_route(self.channel.id());
        let _ = child.join().expect("reader panicked");
    }
}

fn stratum_error(request: &RpcRequest, code: i64, message: &str) -> Value {
    json!({
        "id": request.id.as_ref().map_or(Value::Null, |id| id.to_value()),
        "result": Value::Null,
        "error": [code, message, Value::Null],
    })
}

pub struct StratumServer {
    session: Arc<Session>,
}

impl StratumServer {
    pub fn start(
        options: SessionOptions,
        query: Arc<Query>,
        notifier: Arc<Notifier>,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let serve_shutdown = shutdown.clone();
        let session = Session::start("stratum", options, shutdown, move |channel, stream| {
            let conn = Connection::new(Arc::clone(&query), Arc::clone(&notifier), channel);
            conn.run(stream, serve_shutdown.clone());
        })?;
        info!(target: LT, "Stratum v1 server running");
        Ok(StratumServer {
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

// Stratum v2 transport framing.
// ----------------------------------------------------------------------------
//
// Binary TLV frames: [extension_type:u16 LE][msg_type:u8][length:u24 LE]
// [payload]. Only the connection setup lifecycle is spoken; job delivery
// stays on v1.

pub const SV2_HEADER_SIZE: usize = 6;
pub const SV2_MAX_PAYLOAD: usize = 0x00ff_ffff;

pub const SV2_MSG_SETUP_CONNECTION: u8 = 0x00;
pub const SV2_MSG_SETUP_CONNECTION_SUCCESS: u8 = 0x01;
pub const SV2_MSG_SETUP_CONNECTION_ERROR: u8 = 0x02;

/// The protocol version range this listener accepts.
const SV2_VERSION: u16 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sv2Frame {
    pub extension_type: u16,
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

pub fn encode_frame(frame: &Sv2Frame) -> Result<Vec<u8>> {
    if frame.payload.len() > SV2_MAX_PAYLOAD {
        bail!(GatewayError::BadAlloc);
    }
    let mut out = Vec::with_capacity(SV2_HEADER_SIZE + frame.payload.len());
    out.extend(&frame.extension_type.to_le_bytes());
    out.push(frame.msg_type);
    let length = (frame.payload.len() as u32).to_le_bytes();
    out.extend(&length[..3]);
    out.extend(&frame.payload);
    Ok(out)
}

/// Decode one frame from the front of `buffer`. `Ok(None)` means more bytes
/// are needed; on success the consumed length is returned alongside.
pub fn decode_frame(buffer: &[u8]) -> Result<Option<(Sv2Frame, usize)>> {
    if buffer.len() < SV2_HEADER_SIZE {
        return Ok(None);
    }
    let extension_type = u16::from_le_bytes([buffer[0], buffer[1]]);
    let msg_type = buffer[2];
    let length = u32::from_le_bytes([buffer[3], buffer[4], buffer[5], 0]) as usize;
    let total = SV2_HEADER_SIZE + length;
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some((
        Sv2Frame {
            extension_type,
            msg_type,
            payload: buffer[SV2_HEADER_SIZE..total].to_vec(),
        },
        total,
    )))
}

/// SetupConnection, the opening message of every v2 connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupConnection {
    pub protocol: u8,
    pub min_version: u16,
    pub max_version: u16,
    pub flags: u32,
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub vendor: String,
    pub hardware_version: String,
    pub firmware: String,
    pub device_id: String,
}

fn read_str0_255<'a>(buffer: &'a [u8], cursor: &mut usize) -> Result<String> {
    let len = *buffer.get(*cursor).ok_or(GatewayError::BadStream)? as usize;
    *cursor += 1;
    let bytes = buffer
        .get(*cursor..*cursor + len)
        .ok_or(GatewayError::BadStream)?;
    *cursor += len;
    Ok(String::from_utf8(bytes.to_vec()).map_err(|_| GatewayError::BadStream)?)
}

fn write_str0_255(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255);
    out.push(len as u8);
    out.extend(&bytes[..len]);
}

impl SetupConnection {
    pub fn decode(payload: &[u8]) -> Result<SetupConnection> {
        if payload.len() < 9 {
            bail!(GatewayError::BadStream);
        }
        let mut cursor = 9;
        let setup = SetupConnection {
            protocol: payload[0],
            min_version: u16::from_le_bytes([payload[1], payload[2]]),
            max_version: u16::from_le_bytes([payload[3], payload[4]]),
            flags: u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]),
            endpoint_host: read_str0_255(payload, &mut cursor)?,
            endpoint_port: {
                let bytes = payload
                    .get(cursor..cursor + 2)
                    .ok_or(GatewayError::BadStream)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]])
            },
            vendor: read_str0_255(payload, &mut cursor)?,
            hardware_version: read_str0_255(payload, &mut cursor)?,
            firmware: read_str0_255(payload, &mut cursor)?,
            device_id: read_str0_255(payload, &mut cursor)?,
        };
        Ok(setup)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.protocol);
        out.extend(&self.min_version.to_le_bytes());
        out.extend(&self.max_version.to_le_bytes());
        out.extend(&self.flags.to_le_bytes());
        write_str0_255(&mut out, &self.endpoint_host);
        out.extend(&self.endpoint_port.to_le_bytes());
        write_str0_255(&mut out, &self.vendor);
        write_str0_255(&mut out, &self.hardware_version);
        write_str0_255(&mut out, &self.firmware);
        write_str0_255(&mut out, &self.device_id);
        out
    }
}

fn setup_success(used_version: u16, flags: u32) -> Sv2Frame {
    let mut payload = Vec::with_capacity(6);
    payload.extend(&used_version.to_le_bytes());
    payload.extend(&flags.to_le_bytes());
    Sv2Frame {
        extension_type: 0,
        msg_type: SV2_MSG_SETUP_CONNECTION_SUCCESS,
        payload,
    }
}

fn setup_error(error_code: &str) -> Sv2Frame {
    let mut payload = Vec::new();
    payload.extend(&0u32.to_le_bytes()); // flags
    write_str0_255(&mut payload, error_code);
    Sv2Frame {
        extension_type: 0,
        msg_type: SV2_MSG_SETUP_CONNECTION_ERROR,
        payload,
    }
}

/// Run the v2 setup lifecycle on one connection: a valid SetupConnection
/// with a compatible version range answers success and holds the channel
/// open; anything else answers an error frame and closes.
fn serve_v2(channel: Arc<Channel>, mut stream: TcpStream, shutdown: ShutdownToken) {
    channel.transition(ChannelState::Handshaking);
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut ready = false;

    loop {
        if shutdown.is_signaled() {
            return;
        }
        let frame = match decode_frame(&buffer) {
            Ok(Some((frame, consumed))) => {
                buffer.drain(..consumed);
                Some(frame)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(target: LT, "v2 framing error: {}", fmt_error_chain(&e));
                return;
            }
        };

        if let Some(frame) = frame {
            match (frame.msg_type, ready) {
                (SV2_MSG_SETUP_CONNECTION, false) => {
                    let reply = match SetupConnection::decode(&frame.payload) {
                        Ok(setup) if setup.min_version <= SV2_VERSION && SV2_VERSION <= setup.max_version => {
                            debug!(
                                target: LT,
                                "[{}] v2 setup from {} ({})",
                                channel.addr(),
                                setup.vendor,
                                setup.device_id
                            );
                            ready = true;
                            channel.transition(ChannelState::Ready);
                            setup_success(SV2_VERSION, 0)
                        }
                        Ok(_) => setup_error("unsupported-protocol-version"),
                        Err(_) => setup_error("malformed-setup-connection"),
                    };
                    let encoded = match encode_frame(&reply) {
                        Ok(encoded) => encoded,
                        Err(_) => return,
                    };
                    if channel.send(encoded).is_err() || !ready {
                        return;
                    }
                }
                (_, false) => {
                    // nothing is valid before setup
                    let _ = encode_frame(&setup_error("setup-connection-expected"))
                        .map(|encoded| channel.send(encoded));
                    return;
                }
                (msg_type, true) => {
                    // the job protocol itself is not offered on v2
                    trace!(target: LT, "ignoring v2 message type {:#04x}", msg_type);
                }
            }
            continue;
        }

        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend(&chunk[..n]),
        }
    }
}

pub struct StratumV2Server {
    session: Arc<Session>,
}

impl StratumV2Server {
    pub fn start(
        options: SessionOptions,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let serve_shutdown = shutdown.clone();
        let session = Session::start("stratum-v2", options, shutdown, move |channel, stream| {
            serve_v2(channel, stream, serve_shutdown.clone());
        })?;
        info!(target: LT, "Stratum v2 listener running (setup lifecycle only)");
        Ok(StratumV2Server {
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
    fn v2_frame_codec_round_trips() {
        let frame = Sv2Frame {
            extension_type: 0x0001,
            msg_type: 0x42,
            payload: vec![1, 2, 3, 4, 5],
        };
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(encoded.len(), SV2_HEADER_SIZE + 5);

        let (decoded, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn v2_decode_waits_for_full_frames() {
        let frame = Sv2Frame {
            extension_type: 0,
            msg_type: SV2_MSG_SETUP_CONNECTION,
            payload: vec![0; 32],
        };
        let encoded = encode_frame(&frame).unwrap();
        assert!(decode_frame(&encoded[..3]).unwrap().is_none());
        assert!(decode_frame(&encoded[..SV2_HEADER_SIZE + 10]).unwrap().is_none());
        assert!(decode_frame(&encoded).unwrap().is_some());
    }

    #[test]
    fn setup_connection_round_trips() {
        let setup = SetupConnection {
            protocol: 0,
            min_version: 2,
            max_version: 2,
            flags: 0b1,
            endpoint_host: "pool.example".into(),
            endpoint_port: 3336,
            vendor: "bsg-test".into(),
            hardware_version: "1".into(),
            firmware: "fw0".into(),
            device_id: "dev-1".into(),
        };
        let decoded = SetupConnection::decode(&setup.encode()).unwrap();
        assert_eq!(decoded, setup);
    }

    #[test]
    fn truncated_setup_is_bad_stream() {
        let err = SetupConnection::decode(&[0, 2, 0]).unwrap_err();
        assert_eq!(gateway_error(&err), Some(GatewayError::BadStream));
    }

    #[test]
    fn prevhash_is_word_swapped() {
        // word-swap is an involution with a byte reverse on either side
        let display = "000000000000000000021a1f99a4c44e9cb07d94e2ec0ba8a4b6f34cbd6ea119";
        let swapped = stratum_prevhash(display).unwrap();
        assert_eq!(swapped.len(), 64);
        assert_ne!(swapped, display);
        // round-trip through the same transform recovers the original words
        let mut bytes = Vec::<u8>::from_hex(&swapped).unwrap();
        let mut unswapped = Vec::new();
        for word in bytes.chunks(4) {
            unswapped.extend(word.iter().rev());
        }
        bytes = unswapped;
        bytes.reverse();
        assert_eq!(bytes.to_hex(), display);
    }

    #[test]
    fn coinbase_halves_declare_the_extranonce_gap() {
        let (coinb1, coinb2) = build_coinbase_halves(680_000, 312_500_000, 8);
        // script length byte sits right after the 32+4 byte null prevout,
        // the 4 byte version and the input count
        let script_len = coinb1[4 + 1 + 32 + 4] as usize;
        let script_prefix_len = coinb1.len() - (4 + 1 + 32 + 4 + 1);
        assert_eq!(script_len, script_prefix_len + 8);
        // coinb2 carries sequence, one output and locktime
        assert_eq!(coinb2.len(), 4 + 1 + 8 + 2 + 4);
    }

    #[test]
    fn jobs_from_templates_have_the_notify_shape() {
        let template = json!({
            "previousblockhash": "000000000000000000021a1f99a4c44e9cb07d94e2ec0ba8a4b6f34cbd6ea119",
            "height": 680_000,
            "coinbasevalue": 625_000_000u64,
            "version": 0x20000000u32,
            "bits": "170d21b9",
            "curtime": 1_720_000_000u64,
            "transactions": [],
        });
        let job = job_from_template(&template, true).unwrap();
        assert!(job.merkle_branch.is_empty());
        assert_eq!(job.version, "20000000");
        assert_eq!(job.nbits, "170d21b9");
        assert!(job.clean);

        let params = job.notify_params();
        assert_eq!(params.as_array().unwrap().len(), 9);
    }

    #[test]
    fn job_ids_are_unique() {
        let template = json!({
            "previousblockhash": "000000000000000000021a1f99a4c44e9cb07d94e2ec0ba8a4b6f34cbd6ea119",
            "height": 1,
            "coinbasevalue": 50u64,
            "version": 1,
            "bits": "1d00ffff",
            "curtime": 1_231_006_505u64,
            "transactions": [],
        });
        let a = job_from_template(&template, false).unwrap();
        let b = job_from_template(&template, false).unwrap();
        assert_ne!(a.id, b.id);
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc as tmpsc;
use warp::http::{Response, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

use crate::bitcoind::BitcoindRpc;
use crate::channel::next_channel_id;
use crate::error::{fmt_error_chain, GatewayError};
use crate::estimator::Estimator;
use crate::native::{self, Media, NativeResponse};
use crate::notifier::{Notification, Notifier, NotifySink, Route, SinkError, SubscriptionKind};
use crate::query::Query;
use crate::rpc::{rpc_notification, RpcParams, RpcRequest};
use crate::types::Binary;
use crate::util::{spawn_thread, ShutdownToken};

const LT: &str = "bsg::http";

/// Inbound WebSocket application messages are capped well below the line
/// protocols' limit.
const WS_MESSAGE_LIMIT: usize = 4096;

/// Outbound notifications queued per WebSocket before overflow.
const WS_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub addr: SocketAddr,
    /// Exact-match (case-insensitive) host allow-list; empty allows any.
    pub allowed_hosts: Vec<String>,
    /// Exact-match origin allow-list, enforced only when an Origin header
    /// is present; empty allows any.
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval: Duration,
    pub witness: bool,
}

// Admission.
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Refused(GatewayError);

impl warp::reject::Reject for Refused {}

fn check_admission(
    options: &HttpOptions,
    host: Option<&str>,
    origin: Option<&str>,
) -> Result<(), GatewayError> {
    if !options.allowed_hosts.is_empty() {
        let host = host.ok_or(GatewayError::BadHost)?;
        let bare = host.splitn(2, ':').next().unwrap_or("");
        let allowed = options
            .allowed_hosts
            .iter()
            .any(|allow| allow.eq_ignore_ascii_case(host) || allow.eq_ignore_ascii_case(bare));
        if !allowed {
            return Err(GatewayError::BadHost);
        }
    }
    // origin is only enforced when the request carries one
    if let Some(origin) = origin {
        if !options.allowed_origins.is_empty()
            && !options.allowed_origins.iter().any(|allow| allow == origin)
        {
            return Err(GatewayError::ForbiddenOrigin);
        }
    }
    Ok(())
}

fn admission(
    options: Arc<HttpOptions>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("host")
        .and(warp::header::optional::<String>("origin"))
        .and_then(move |host: Option<String>, origin: Option<String>| {
            let options = Arc::clone(&options);
            async move {
                match check_admission(&options, host.as_deref(), origin.as_deref()) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(target: LT, "refused request: {}", e);
                        Err(warp::reject::custom(Refused(e)))
                    }
                }
            }
        })
        .untuple_one()
}

async fn recover(rejection: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(Refused(cause)) = rejection.find::<Refused>() {
        let status =
            StatusCode::from_u16(cause.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok(warp::reply::with_status(cause.to_string(), status));
    }
    if rejection.is_not_found() {
        return Ok(warp::reply::with_status(
            GatewayError::NotFound.to_string(),
            StatusCode::NOT_FOUND,
        ));
    }
    Err(rejection)
}

fn to_reply(response: NativeResponse) -> Response<Vec<u8>> {
    Response::builder()
        .status(response.status)
        .header("Content-Type", response.content_type)
        .body(response.body)
        .expect("static response parts")
}

// Native REST + WebSocket server.
// ----------------------------------------------------------------------------

pub struct NativeHttpServer {
    addr: SocketAddr,
}

impl NativeHttpServer {
    pub fn start(
        options: HttpOptions,
        query: Arc<Query>,
        notifier: Arc<Notifier>,
        shutdown: ShutdownToken,
    ) -> Self {
        let addr = options.addr;
        spawn_thread("http-native", move || {
            run_native(options, query, notifier, shutdown)
        });
        NativeHttpServer { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[tokio::main]
async fn run_native(
    options: HttpOptions,
    query: Arc<Query>,
    notifier: Arc<Notifier>,
    shutdown: ShutdownToken,
) {
    let options = Arc::new(options);
    let with_query = {
        let query = Arc::clone(&query);
        warp::any().map(move || Arc::clone(&query))
    };

    // GET /v<N>/... per the native path grammar
    let rest = warp::get()
        .and(warp::path::full())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::header::optional::<String>("accept"))
        .and(with_query.clone())
        .map(
            |path: FullPath, query_string: String, accept: Option<String>, query: Arc<Query>| {
                to_reply(serve_native_path(
                    &query,
                    path.as_str(),
                    &query_string,
                    accept.as_deref(),
                ))
            },
        );

    // GET /ws, the native API over WebSocket with subscriptions
    let ws_options = Arc::clone(&options);
    let ws_notifier = Arc::clone(&notifier);
    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_query)
        .map(move |upgrade: warp::ws::Ws, query: Arc<Query>| {
            let notifier = Arc::clone(&ws_notifier);
            let options = Arc::clone(&ws_options);
            upgrade.on_upgrade(move |socket| serve_ws(socket, query, notifier, options))
        });

    let routes = admission(Arc::clone(&options))
        .and(ws.or(rest))
        .recover(recover);

    let (_, server) =
        warp::serve(routes).bind_with_graceful_shutdown(options.addr, wait_shutdown(shutdown));
    info!(target: LT, "native HTTP server running on {}", options.addr);
    server.await;
    info!(target: LT, "native HTTP server stopped");
}

fn serve_native_path(
    query: &Arc<Query>,
    path: &str,
    query_string: &str,
    accept: Option<&str>,
) -> NativeResponse {
    let (method, mut params) = match native::parse_target(path) {
        Ok(parsed) => parsed,
        Err(e) => return native::error_response(e),
    };
    match native::parse_query(query_string, accept, &mut params) {
        Ok(Some(())) => (),
        Ok(None) => {
            return NativeResponse {
                status: 406,
                content_type: "text/plain",
                body: b"no acceptable media type".to_vec(),
            }
        }
        Err(e) => return native::error_response(e),
    }
    match native::respond(query, method, &params) {
        Ok(response) => response,
        Err(e) => {
            debug!(target: LT, "{} failed: {}", path, fmt_error_chain(&e));
            native::error_to_response(&e)
        }
    }
}

// WebSocket plumbing.
// ----------------------------------------------------------------------------

enum WsOut {
    Notify(Notification),
    Heartbeat(Value),
    Reply(Value),
}

/// Notifier sink over the unbounded forwarder channel; depth is accounted
/// manually so a stalled socket shows up as overflow rather than unbounded
/// growth.
struct WsSink {
    tx: tmpsc::UnboundedSender<WsOut>,
    queued: Arc<AtomicUsize>,
}

impl NotifySink for WsSink {
    fn notify(&self, notification: &Notification) -> Result<(), SinkError> {
        if self.queued.load(Ordering::SeqCst) >= WS_QUEUE_DEPTH {
            return Err(SinkError::Overflow);
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(WsOut::Notify(notification.clone()))
            .map_err(|_| SinkError::Closed)
    }
}

async fn serve_ws(
    socket: warp::ws::WebSocket,
    query: Arc<Query>,
    notifier: Arc<Notifier>,
    options: Arc<HttpOptions>,
) {
    let route_id = next_channel_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = tmpsc::unbounded_channel::<WsOut>();
    let queued = Arc::new(AtomicUsize::new(0));
    let heartbeat = Arc::new(AtomicBool::new(false));

    debug!(target: LT, "ws route {} connected", route_id);

    // writer half: drains replies, notifications and heartbeats
    let witness = options.witness;
    let writer_queued = Arc::clone(&queued);
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let value = match out {
                WsOut::Notify(notification) => {
                    writer_queued.fetch_sub(1, Ordering::SeqCst);
                    rpc_notification("notify", notification.to_json(witness))
                }
                WsOut::Heartbeat(value) => rpc_notification("heartbeat", value),
                WsOut::Reply(value) => value,
            };
            if ws_tx
                .send(warp::ws::Message::text(value.to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // periodic tip announcements for channels that opted in
    // unwinds by itself once the forwarder channel closes
    let beat_tx = out_tx.clone();
    let beat_enabled = Arc::clone(&heartbeat);
    let beat_query = Arc::clone(&query);
    let interval = options.heartbeat_interval;
    let _beater = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !beat_enabled.load(Ordering::SeqCst) {
                continue;
            }
            let tip = beat_query.get_tip();
            let value = match tip {
                Ok(tip) => json!({ "height": tip.height(), "hash": tip.hash().to_string() }),
                Err(_) => continue,
            };
            if beat_tx.send(WsOut::Heartbeat(value)).is_err() {
                return;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        if message.is_close() {
            break;
        }
        if !message.is_text() {
            continue;
        }
        if message.as_bytes().len() > WS_MESSAGE_LIMIT {
            warn!(target: LT, "ws route {} oversized message", route_id);
            break;
        }
        let text = match message.to_str() {
            Ok(text) => text,
            Err(()) => break,
        };

        let reply = handle_ws_request(
            text,
            route_id,
            &out_tx,
            &queued,
            &query,
            &notifier,
            &heartbeat,
        );
        if let Some(reply) = reply {
            if out_tx.send(WsOut::Reply(reply)).is_err() {
                break;
            }
        }
    }

    debug!(target: LT, "ws route {} disconnected", route_id);
    notifier.unsubscribe_route(route_id);
    drop(out_tx);
    let _ = writer.await;
}

fn parse_selector(params: &RpcParams) -> Result<(SubscriptionKind, Binary), GatewayError> {
    let object = match params {
        RpcParams::Named(map) => map,
        _ => return Err(GatewayError::InvalidArgument),
    };
    let kind: SubscriptionKind = serde_json::from_value(
        object.get("kind").cloned().ok_or(GatewayError::InvalidArgument)?,
    )
    .map_err(|_| GatewayError::InvalidArgument)?;
    let selector = match object.get("selector") {
        None | Some(Value::Null) => Binary::empty(),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|_| GatewayError::BadStream)?
        }
    };
    Ok((kind, selector))
}

fn handle_ws_request(
    text: &str,
    route_id: u64,
    out_tx: &tmpsc::UnboundedSender<WsOut>,
    queued: &Arc<AtomicUsize>,
    query: &Arc<Query>,
    notifier: &Arc<Notifier>,
    heartbeat: &Arc<AtomicBool>,
) -> Option<Value> {
    let request = match RpcRequest::parse_str(text) {
        Ok(request) => request,
        Err(e) => {
            let poison = RpcRequest {
                version: crate::rpc::RpcVersion::V2,
                id: Some(crate::rpc::RpcId::Null),
                method: String::new(),
                params: RpcParams::None,
            };
            return Some(poison.response_gateway_err(e));
        }
    };

    let result: Result<Value, GatewayError> = match request.method.as_str() {
        "subscribe" => parse_selector(&request.params).and_then(|(kind, selector)| {
            let route = Route::new(
                route_id,
                Arc::new(WsSink {
                    tx: out_tx.clone(),
                    queued: Arc::clone(queued),
                }),
            );
            notifier.subscribe(route, kind, selector)?;
            Ok(json!(true))
        }),
        "unsubscribe" => parse_selector(&request.params)
            .map(|(kind, selector)| json!(notifier.unsubscribe(route_id, kind, selector))),
        "renew" => parse_selector(&request.params).map(|(kind, selector)| {
            notifier.renew(route_id, kind, selector);
            json!(true)
        }),
        "heartbeat" => {
            let enable = match &request.params {
                RpcParams::Positional(values) => values.get(0).and_then(Value::as_bool),
                RpcParams::Named(map) => map.get("enabled").and_then(Value::as_bool),
                RpcParams::None => Some(true),
            };
            match enable {
                Some(enable) => {
                    heartbeat.store(enable, Ordering::SeqCst);
                    Ok(json!(enable))
                }
                None => Err(GatewayError::InvalidArgument),
            }
        }
        // the REST grammar, tunneled: {"method": "get", "params": ["/v1/top?format=json"]}
        "get" => {
            let path = match &request.params {
                RpcParams::Positional(values) => values.get(0).and_then(Value::as_str),
                RpcParams::Named(map) => map.get("path").and_then(Value::as_str),
                RpcParams::None => None,
            };
            match path {
                Some(path) => {
                    let mut parts = path.splitn(2, '?');
                    let target = parts.next().unwrap_or("");
                    let query_string = parts.next().unwrap_or("");
                    let response = serve_native_path(query, target, query_string, None);
                    if response.status == 200 {
                        match serde_json::from_slice(&response.body) {
                            Ok(value) => Ok(value),
                            Err(_) => Ok(json!(String::from_utf8_lossy(&response.body))),
                        }
                    } else {
                        Err(GatewayError::NotFound)
                    }
                }
                None => Err(GatewayError::InvalidArgument),
            }
        }
        _ => Err(GatewayError::MethodNotFound),
    };

    if request.is_notification() {
        return None;
    }
    Some(match result {
        Ok(result) => request.response_ok(result),
        Err(e) => request.response_gateway_err(e),
    })
}

// bitcoind-style JSON-RPC (+REST) server.
// ----------------------------------------------------------------------------

pub struct BitcoindHttpServer {
    addr: SocketAddr,
}

impl BitcoindHttpServer {
    pub fn start(
        options: HttpOptions,
        query: Arc<Query>,
        estimator: Arc<Estimator>,
        rest_enabled: bool,
        shutdown: ShutdownToken,
    ) -> Self {
        let addr = options.addr;
        spawn_thread("http-bitcoind", move || {
            run_bitcoind(options, query, estimator, rest_enabled, shutdown)
        });
        BitcoindHttpServer { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[tokio::main]
async fn run_bitcoind(
    options: HttpOptions,
    query: Arc<Query>,
    estimator: Arc<Estimator>,
    rest_enabled: bool,
    shutdown: ShutdownToken,
) {
    let options = Arc::new(options);
    let rpc = Arc::new(BitcoindRpc::new(Arc::clone(&query), estimator));
    let with_rpc = warp::any().map(move || Arc::clone(&rpc));
    let allow_origin = if options.allowed_origins.is_empty() {
        "*".to_string()
    } else {
        options.allowed_origins.join(", ")
    };

    // POST / with a single JSON-RPC v1/v2 object
    let origin = allow_origin.clone();
    let post = warp::post()
        .and(warp::body::json::<Value>())
        .and(with_rpc)
        .map(move |body: Value, rpc: Arc<BitcoindRpc>| {
            let reply = match RpcRequest::parse(body) {
                Ok(request) => {
                    let response = rpc.handle(&request);
                    if request.is_notification() {
                        // notifications produce no body
                        Value::Null
                    } else {
                        response
                    }
                }
                Err(e) => json!({
                    "id": Value::Null,
                    "result": Value::Null,
                    "error": { "code": e.rpc_code(), "message": e.to_string() },
                }),
            };
            Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .header("Access-Control-Allow-Origin", origin.clone())
                .body(reply.to_string().into_bytes())
                .expect("static response parts")
        });

    // OPTIONS preflight
    let origin = allow_origin.clone();
    let preflight = warp::options().map(move || {
        Response::builder()
            .status(204)
            .header("Access-Control-Allow-Origin", origin.clone())
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
            .body(Vec::new())
            .expect("static response parts")
    });

    // the optional bitcoind-style REST subset under the same port
    let rest_query = Arc::clone(&query);
    let rest = warp::get()
        .and(warp::path("rest"))
        .and(warp::path::tail())
        .map(move |tail: warp::path::Tail| {
            if rest_enabled {
                to_reply(serve_bitcoind_rest(&rest_query, tail.as_str()))
            } else {
                to_reply(native::error_response(GatewayError::NotFound))
            }
        });

    let routes = admission(Arc::clone(&options))
        .and(rest.or(preflight).or(post))
        .recover(recover);

    let (_, server) =
        warp::serve(routes).bind_with_graceful_shutdown(options.addr, wait_shutdown(shutdown));
    info!(target: LT, "bitcoind RPC server running on {}", options.addr);
    server.await;
    info!(target: LT, "bitcoind RPC server stopped");
}

/// `/rest/chaininfo.json`, `/rest/block/<hash>.<ext>`, `/rest/tx/<hash>.<ext>`
/// with `ext` in `{json, hex, bin}`.
fn serve_bitcoind_rest(query: &Arc<Query>, tail: &str) -> NativeResponse {
    use bitcoin_hashes::hex::ToHex;

    let segments: Vec<&str> = tail.split('/').filter(|s| !s.is_empty()).collect();
    let result = (|| -> crate::error::Result<NativeResponse> {
        match segments.as_slice() {
            ["chaininfo.json"] => Ok(json_response(query.get_blockchain_info()?)),
            ["block", spec] | ["tx", spec] => {
                let (hash, ext) = split_extension(spec)?;
                let is_block = segments[0] == "block";
                if ext == "json" {
                    let value = if is_block {
                        query
                            .get_block_info(&hash.parse().map_err(|_| GatewayError::InvalidHash)?)?
                    } else {
                        query.get_tx_json(&hash.parse().map_err(|_| GatewayError::InvalidHash)?)?
                    };
                    return Ok(json_response(value));
                }
                let bytes = if is_block {
                    query.get_block_raw(&hash.parse().map_err(|_| GatewayError::InvalidHash)?)?
                } else {
                    query.get_tx_raw(&hash.parse().map_err(|_| GatewayError::InvalidHash)?)?
                };
                Ok(match ext {
                    "bin" => NativeResponse {
                        status: 200,
                        content_type: Media::Data.content_type(),
                        body: bytes,
                    },
                    _ => NativeResponse {
                        status: 200,
                        content_type: Media::Text.content_type(),
                        body: bytes.to_hex().into_bytes(),
                    },
                })
            }
            _ => Err(GatewayError::NotFound.into()),
        }
    })();

    result.unwrap_or_else(|e| native::error_to_response(&e))
}

fn split_extension(spec: &str) -> Result<(&str, &str), GatewayError> {
    let mut parts = spec.rsplitn(2, '.');
    let ext = parts.next().ok_or(GatewayError::NotFound)?;
    let hash = parts.next().ok_or(GatewayError::NotFound)?;
    match ext {
        "json" | "hex" | "bin" => Ok((hash, ext)),
        _ => Err(GatewayError::NotFound),
    }
}

fn json_response(value: Value) -> NativeResponse {
    NativeResponse {
        status: 200,
        content_type: Media::Json.content_type(),
        body: value.to_string().into_bytes(),
    }
}

async fn wait_shutdown(shutdown: ShutdownToken) {
    // bridge the blocking token into the async world
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    spawn_thread("http-shutdown", move || {
        while !shutdown.wait_timeout(Duration::from_millis(500)) {}
        let _ = tx.send(());
    });
    let _ = rx.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(hosts: &[&str], origins: &[&str]) -> HttpOptions {
        HttpOptions {
            addr: "127.0.0.1:0".parse().unwrap(),
            allowed_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(4),
            witness: true,
        }
    }

    #[test]
    fn empty_lists_allow_anything() {
        let options = options(&[], &[]);
        assert!(check_admission(&options, None, None).is_ok());
        assert!(check_admission(&options, Some("example.com"), Some("https://x")).is_ok());
    }

    #[test]
    fn host_matching_is_case_insensitive_and_port_tolerant() {
        let options = options(&["node.example.com"], &[]);
        assert!(check_admission(&options, Some("Node.Example.Com"), None).is_ok());
        assert!(check_admission(&options, Some("node.example.com:8332"), None).is_ok());
        assert_eq!(
            check_admission(&options, Some("evil.com"), None).unwrap_err(),
            GatewayError::BadHost
        );
        assert_eq!(
            check_admission(&options, None, None).unwrap_err(),
            GatewayError::BadHost
        );
    }

    #[test]
    fn origin_enforced_only_when_present() {
        let options = options(&[], &["https://wallet.example"]);
        assert!(check_admission(&options, None, None).is_ok());
        assert!(check_admission(&options, None, Some("https://wallet.example")).is_ok());
        assert_eq!(
            check_admission(&options, None, Some("https://evil.example")).unwrap_err(),
            GatewayError::ForbiddenOrigin
        );
    }

    #[test]
    fn rest_extension_splitting() {
        assert_eq!(split_extension("abc.json").unwrap(), ("abc", "json"));
        assert_eq!(split_extension("abc.hex").unwrap(), ("abc", "hex"));
        assert_eq!(split_extension("abc.bin").unwrap(), ("abc", "bin"));
        assert!(split_extension("abc.xml").is_err());
        assert!(split_extension("abc").is_err());
    }

    #[test]
    fn ws_selector_parsing() {
        let request = RpcRequest::parse_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"subscribe",
                "params":{"kind":"address_prefix","selector":{"bits":8,"data":"00"}}}"#,
        )
        .unwrap();
        let (kind, selector) = parse_selector(&request.params).unwrap();
        assert_eq!(kind, SubscriptionKind::AddressPrefix);
        assert_eq!(selector.bits(), 8);

        let headers = RpcRequest::parse_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"subscribe","params":{"kind":"header"}}"#,
        )
        .unwrap();
        let (kind, selector) = parse_selector(&headers.params).unwrap();
        assert_eq!(kind, SubscriptionKind::Header);
        assert!(selector.is_empty());
    }
}

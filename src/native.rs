use std::sync::Arc;

use bitcoin::{BlockHash, Txid};
use bitcoin_hashes::hex::{FromHex, ToHex};
use bitcoin_hashes::Hash;
use serde_json::Value;

use crate::error::{gateway_error, GatewayError, Result};
use crate::notifier::serialize_tx;
use crate::query::Query;
use crate::types::ScriptHash;

/// The native REST interface: a path grammar parsed into `(method, params)`,
/// media negotiation, and the per-method execution against the query facade.
///
/// Grammar:
/// `/v<u8>/{top | address/<hash>[/...] | tx/<hash>[/...] | input/<hash>[/...]
///   | output/<hash>[/...] | block/(hash/<hash>|height/<u32>)[/...]}`
/// with `?format=`, `?witness=` and `?turbo=` modifiers.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeMethod {
    Top,
    Address,
    AddressConfirmed,
    AddressUnconfirmed,
    AddressBalance,
    Tx,
    TxHeader,
    TxDetails,
    Inputs,
    Input,
    InputScript,
    InputWitness,
    Outputs,
    Output,
    OutputScript,
    OutputSpender,
    OutputSpenders,
    Block,
    BlockHeader,
    BlockHeaderContext,
    BlockTxs,
    BlockDetails,
    BlockTx,
    BlockFilter,
    BlockFilterHash,
    BlockFilterHeader,
}

impl NativeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            NativeMethod::Top => "top",
            NativeMethod::Address => "address",
            NativeMethod::AddressConfirmed => "address_confirmed",
            NativeMethod::AddressUnconfirmed => "address_unconfirmed",
            NativeMethod::AddressBalance => "address_balance",
            NativeMethod::Tx => "tx",
            NativeMethod::TxHeader => "tx_header",
            NativeMethod::TxDetails => "tx_details",
            NativeMethod::Inputs => "inputs",
            NativeMethod::Input => "input",
            NativeMethod::InputScript => "input_script",
            NativeMethod::InputWitness => "input_witness",
            NativeMethod::Outputs => "outputs",
            NativeMethod::Output => "output",
            NativeMethod::OutputScript => "output_script",
            NativeMethod::OutputSpender => "output_spender",
            NativeMethod::OutputSpenders => "output_spenders",
            NativeMethod::Block => "block",
            NativeMethod::BlockHeader => "block_header",
            NativeMethod::BlockHeaderContext => "block_header_context",
            NativeMethod::BlockTxs => "block_txs",
            NativeMethod::BlockDetails => "block_details",
            NativeMethod::BlockTx => "block_tx",
            NativeMethod::BlockFilter => "block_filter",
            NativeMethod::BlockFilterHash => "block_filter_hash",
            NativeMethod::BlockFilterHeader => "block_filter_header",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Media {
    Json,
    Text,
    Data,
    Html,
}

impl Media {
    pub fn content_type(self) -> &'static str {
        match self {
            Media::Json => "application/json",
            Media::Text => "text/plain",
            Media::Data => "application/octet-stream",
            Media::Html => "text/html",
        }
    }
}

/// Parsed request parameters; hashes are stored in internal byte order
/// (paths carry them reversed, like every bitcoin display hex).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeParams {
    pub version: u8,
    pub hash: Option<[u8; 32]>,
    pub height: Option<u32>,
    pub index: Option<u32>,
    pub position: Option<u32>,
    pub filter_type: Option<u8>,
    pub witness: bool,
    pub turbo: bool,
    pub media: Media,
}

impl Default for NativeParams {
    fn default() -> Self {
        NativeParams {
            version: 1,
            hash: None,
            height: None,
            index: None,
            position: None,
            filter_type: None,
            witness: true,
            turbo: true,
            media: Media::Json,
        }
    }
}

// Segment parsing.
// ----------------------------------------------------------------------------

/// ASCII digits only, no leading zero (except "0" itself).
fn to_number<T: std::str::FromStr>(token: &str) -> std::result::Result<T, GatewayError> {
    if token.is_empty()
        || !token.bytes().all(|b| b.is_ascii_digit())
        || (token.len() > 1 && token.starts_with('0'))
    {
        return Err(GatewayError::InvalidNumber);
    }
    token.parse().map_err(|_| GatewayError::InvalidNumber)
}

/// 64 lowercase hex characters, reversed into internal order.
fn to_hash(token: &str) -> std::result::Result<[u8; 32], GatewayError> {
    if token.len() != 64 || token.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(GatewayError::InvalidHash);
    }
    let mut bytes = Vec::<u8>::from_hex(token).map_err(|_| GatewayError::InvalidHash)?;
    bytes.reverse();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hash_hex(hash: &[u8; 32]) -> String {
    let mut bytes = hash.to_vec();
    bytes.reverse();
    bytes.to_hex()
}

/// Parse the path portion into a method and its parameters. The query
/// string (if any) is handled separately by `parse_query`.
pub fn parse_target(path: &str) -> std::result::Result<(NativeMethod, NativeParams), GatewayError> {
    use GatewayError::*;
    use NativeMethod::*;

    let clean = path.splitn(2, '?').next().unwrap_or("");
    let segments: Vec<&str> = clean.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(EmptyPath);
    }

    let mut params = NativeParams::default();
    let mut segment = 0usize;

    if !segments[segment].starts_with('v') {
        return Err(MissingVersion);
    }
    params.version = to_number(&segments[segment][1..])?;
    segment += 1;
    if segment == segments.len() {
        return Err(MissingTarget);
    }

    let target = segments[segment];
    segment += 1;
    let method = match target {
        "top" => Top,
        "address" => {
            if segment == segments.len() {
                return Err(MissingHash);
            }
            params.hash = Some(to_hash(segments[segment])?);
            segment += 1;
            if segment == segments.len() {
                Address
            } else {
                let subcomponent = segments[segment];
                segment += 1;
                match subcomponent {
                    "confirmed" => AddressConfirmed,
                    "unconfirmed" => AddressUnconfirmed,
                    "balance" => AddressBalance,
                    _ => return Err(InvalidSubcomponent),
                }
            }
        }
        "input" => {
            if segment == segments.len() {
                return Err(MissingHash);
            }
            params.hash = Some(to_hash(segments[segment])?);
            segment += 1;
            if segment == segments.len() {
                Inputs
            } else {
                params.index = Some(to_number(segments[segment])?);
                segment += 1;
                if segment == segments.len() {
                    Input
                } else {
                    let subcomponent = segments[segment];
                    segment += 1;
                    match subcomponent {
                        "script" => InputScript,
                        "witness" => InputWitness,
                        _ => return Err(InvalidSubcomponent),
                    }
                }
            }
        }
        "output" => {
            if segment == segments.len() {
                return Err(MissingHash);
            }
            params.hash = Some(to_hash(segments[segment])?);
            segment += 1;
            if segment == segments.len() {
                Outputs
            } else {
                params.index = Some(to_number(segments[segment])?);
                segment += 1;
                if segment == segments.len() {
                    Output
                } else {
                    let subcomponent = segments[segment];
                    segment += 1;
                    match subcomponent {
                        "script" => OutputScript,
                        "spender" => OutputSpender,
                        "spenders" => OutputSpenders,
                        _ => return Err(InvalidSubcomponent),
                    }
                }
            }
        }
        "tx" => {
            if segment == segments.len() {
                return Err(MissingHash);
            }
            params.hash = Some(to_hash(segments[segment])?);
            segment += 1;
            if segment == segments.len() {
                Tx
            } else {
                let component = segments[segment];
                segment += 1;
                match component {
                    "header" => TxHeader,
                    "details" => TxDetails,
                    _ => return Err(InvalidComponent),
                }
            }
        }
        "block" => {
            if segment == segments.len() {
                return Err(MissingIdType);
            }
            let by = segments[segment];
            segment += 1;
            match by {
                "hash" => {
                    if segment == segments.len() {
                        return Err(MissingHash);
                    }
                    params.hash = Some(to_hash(segments[segment])?);
                    segment += 1;
                }
                "height" => {
                    if segment == segments.len() {
                        return Err(MissingHeight);
                    }
                    params.height = Some(to_number(segments[segment])?);
                    segment += 1;
                }
                _ => return Err(InvalidIdType),
            }

            if segment == segments.len() {
                Block
            } else {
                let component = segments[segment];
                segment += 1;
                match component {
                    "tx" => {
                        if segment == segments.len() {
                            return Err(MissingPosition);
                        }
                        params.position = Some(to_number(segments[segment])?);
                        segment += 1;
                        BlockTx
                    }
                    "header" => {
                        if segment == segments.len() {
                            BlockHeader
                        } else {
                            let subcomponent = segments[segment];
                            segment += 1;
                            match subcomponent {
                                "context" => BlockHeaderContext,
                                _ => return Err(InvalidSubcomponent),
                            }
                        }
                    }
                    "txs" => BlockTxs,
                    "details" => BlockDetails,
                    "filter" => {
                        if segment == segments.len() {
                            return Err(MissingTypeId);
                        }
                        params.filter_type = Some(to_number(segments[segment])?);
                        segment += 1;
                        if segment == segments.len() {
                            BlockFilter
                        } else {
                            let subcomponent = segments[segment];
                            segment += 1;
                            match subcomponent {
                                "hash" => BlockFilterHash,
                                "header" => BlockFilterHeader,
                                _ => return Err(InvalidSubcomponent),
                            }
                        }
                    }
                    _ => return Err(InvalidComponent),
                }
            }
        }
        _ => return Err(InvalidTarget),
    };

    if segment == segments.len() {
        Ok((method, params))
    } else {
        Err(GatewayError::ExtraSegment)
    }
}

/// Rebuild the canonical path of a parsed request (modulo query modifiers).
pub fn encode_target(method: NativeMethod, params: &NativeParams) -> String {
    use NativeMethod::*;
    let mut path = format!("/v{}", params.version);
    let hash = params.hash.as_ref().map(hash_hex).unwrap_or_default();
    match method {
        Top => path.push_str("/top"),
        Address => path.push_str(&format!("/address/{}", hash)),
        AddressConfirmed => path.push_str(&format!("/address/{}/confirmed", hash)),
        AddressUnconfirmed => path.push_str(&format!("/address/{}/unconfirmed", hash)),
        AddressBalance => path.push_str(&format!("/address/{}/balance", hash)),
        Tx => path.push_str(&format!("/tx/{}", hash)),
        TxHeader => path.push_str(&format!("/tx/{}/header", hash)),
        TxDetails => path.push_str(&format!("/tx/{}/details", hash)),
        Inputs => path.push_str(&format!("/input/{}", hash)),
        Input => path.push_str(&format!("/input/{}/{}", hash, params.index.unwrap_or(0))),
        InputScript => path.push_str(&format!(
            "/input/{}/{}/script",
            hash,
            params.index.unwrap_or(0)
        )),
        InputWitness => path.push_str(&format!(
            "/input/{}/{}/witness",
            hash,
            params.index.unwrap_or(0)
        )),
        Outputs => path.push_str(&format!("/output/{}", hash)),
        Output => path.push_str(&format!("/output/{}/{}", hash, params.index.unwrap_or(0))),
        OutputScript => path.push_str(&format!(
            "/output/{}/{}/script",
            hash,
            params.index.unwrap_or(0)
        )),
        OutputSpender => path.push_str(&format!(
            "/output/{}/{}/spender",
            hash,
            params.index.unwrap_or(0)
        )),
        OutputSpenders => path.push_str(&format!(
            "/output/{}/{}/spenders",
            hash,
            params.index.unwrap_or(0)
        )),
        Block | BlockHeader | BlockHeaderContext | BlockTxs | BlockDetails | BlockTx
        | BlockFilter | BlockFilterHash | BlockFilterHeader => {
            match params.height {
                Some(height) => path.push_str(&format!("/block/height/{}", height)),
                None => path.push_str(&format!("/block/hash/{}", hash)),
            }
            match method {
                Block => (),
                BlockHeader => path.push_str("/header"),
                BlockHeaderContext => path.push_str("/header/context"),
                BlockTxs => path.push_str("/txs"),
                BlockDetails => path.push_str("/details"),
                BlockTx => path.push_str(&format!("/tx/{}", params.position.unwrap_or(0))),
                BlockFilter => {
                    path.push_str(&format!("/filter/{}", params.filter_type.unwrap_or(0)))
                }
                BlockFilterHash => path.push_str(&format!(
                    "/filter/{}/hash",
                    params.filter_type.unwrap_or(0)
                )),
                BlockFilterHeader => path.push_str(&format!(
                    "/filter/{}/header",
                    params.filter_type.unwrap_or(0)
                )),
                _ => unreachable!(),
            }
        }
    }
    path
}

// Media negotiation.
// ----------------------------------------------------------------------------

/// Apply `format`/`witness`/`turbo` query modifiers and the `Accept` header.
/// `Ok(None)` means nothing acceptable (a 406 at the HTTP layer).
pub fn parse_query(
    query: &str,
    accept: Option<&str>,
    params: &mut NativeParams,
) -> std::result::Result<Option<()>, GatewayError> {
    let mut format = None;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        match key {
            "format" => format = Some(value.to_string()),
            "witness" => match value {
                "true" => params.witness = true,
                "false" => params.witness = false,
                _ => return Err(GatewayError::InvalidArgument),
            },
            "turbo" => match value {
                "true" => params.turbo = true,
                "false" => params.turbo = false,
                _ => return Err(GatewayError::InvalidArgument),
            },
            // unknown query parameters are ignored
            _ => (),
        }
    }

    // query string format wins over http headers
    if let Some(format) = format {
        params.media = match format.as_str() {
            "json" => Media::Json,
            "text" => Media::Text,
            "data" => Media::Data,
            "html" => Media::Html,
            _ => return Err(GatewayError::InvalidArgument),
        };
        return Ok(Some(()));
    }

    // priority json, html, text, data (accept q-values are ignored)
    match accept {
        None | Some("") => {
            params.media = Media::Json;
            Ok(Some(()))
        }
        Some(accept) => {
            let accepts = |token: &str| {
                accept
                    .split(',')
                    .map(|entry| entry.splitn(2, ';').next().unwrap_or("").trim())
                    .any(|entry| entry == token || entry == "*/*")
            };
            params.media = if accepts("application/json") {
                Media::Json
            } else if accepts("text/html") {
                Media::Html
            } else if accepts("text/plain") {
                Media::Text
            } else if accepts("application/octet-stream") {
                Media::Data
            } else {
                return Ok(None);
            };
            Ok(Some(()))
        }
    }
}

// Execution.
// ----------------------------------------------------------------------------

pub struct NativeResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

enum Payload {
    Object(Value),
    Binary(Vec<u8>),
}

fn finish(payload: Payload, media: Media) -> NativeResponse {
    let body = match (&payload, media) {
        (Payload::Object(value), Media::Json) => value.to_string().into_bytes(),
        (Payload::Object(value), Media::Text) => value.to_string().into_bytes(),
        (Payload::Object(value), Media::Data) => value.to_string().into_bytes(),
        (Payload::Object(value), Media::Html) => html_page(&value.to_string()).into_bytes(),
        (Payload::Binary(bytes), Media::Json) => json!({ "hex": bytes.to_hex() })
            .to_string()
            .into_bytes(),
        (Payload::Binary(bytes), Media::Text) => bytes.to_hex().into_bytes(),
        (Payload::Binary(bytes), Media::Data) => bytes.clone(),
        (Payload::Binary(bytes), Media::Html) => html_page(&bytes.to_hex()).into_bytes(),
    };
    NativeResponse {
        status: 200,
        content_type: media.content_type(),
        body,
    }
}

fn html_page(content: &str) -> String {
    let escaped = content.replace('&', "&amp;").replace('<', "&lt;");
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>bsg</title></head>\
         <body><pre id=\"r\">{}</pre>\
         <script>try{{r.textContent=JSON.stringify(JSON.parse(r.textContent),null,2)}}catch(e){{}}</script>\
         </body></html>",
        escaped
    )
}

pub fn error_response(err: GatewayError) -> NativeResponse {
    NativeResponse {
        status: err.http_status(),
        content_type: "text/plain",
        body: err.to_string().into_bytes(),
    }
}

/// Execute a parsed request against the query facade.
pub fn respond(
    query: &Arc<Query>,
    method: NativeMethod,
    params: &NativeParams,
) -> Result<NativeResponse> {
    use NativeMethod::*;

    let media = params.media;
    let payload = match method {
        Top => {
            let tip = query.get_tip()?;
            Payload::Object(json!({ "height": tip.height(), "hash": tip.hash().to_string() }))
        }

        Address | AddressConfirmed | AddressUnconfirmed => {
            let scripthash = param_scripthash(params)?;
            let history = query.get_history(&scripthash);
            let entries: Vec<Value> = history
                .iter()
                .filter(|entry| match method {
                    AddressConfirmed => entry.status.is_confirmed(),
                    AddressUnconfirmed => entry.status.is_unconfirmed(),
                    _ => true,
                })
                .map(|entry| {
                    json!({
                        "tx_hash": entry.txid.to_string(),
                        "height": entry.status.electrum_height(),
                    })
                })
                .collect();
            Payload::Object(json!(entries))
        }
        AddressBalance => {
            let scripthash = param_scripthash(params)?;
            let (confirmed, unconfirmed) = query.get_script_balance(&scripthash);
            Payload::Object(json!({ "confirmed": confirmed, "unconfirmed": unconfirmed }))
        }

        Tx => {
            let txid = param_txid(params)?;
            let tx = query.get_transaction(&txid)?;
            Payload::Binary(serialize_tx(&tx, params.witness))
        }
        TxHeader => {
            let txid = param_txid(params)?;
            let info = query.get_tx_json(&txid)?;
            let block_hash = info["blockhash"]
                .as_str()
                .ok_or(GatewayError::NotFound)?
                .parse::<BlockHash>()
                .map_err(|_| GatewayError::InvalidHash)?;
            Payload::Object(query.get_header_info(&block_hash)?)
        }
        TxDetails => {
            let txid = param_txid(params)?;
            Payload::Object(query.get_tx_json(&txid)?)
        }

        Inputs | Input | InputScript | InputWitness => {
            let txid = param_txid(params)?;
            let tx = query.get_transaction(&txid)?;
            match method {
                Inputs => Payload::Object(json!(tx
                    .input
                    .iter()
                    .map(input_json)
                    .collect::<Vec<Value>>())),
                _ => {
                    let input = tx
                        .input
                        .get(param_index(params)? as usize)
                        .ok_or(GatewayError::NotFound)?;
                    match method {
                        Input => Payload::Object(input_json(input)),
                        InputScript => Payload::Binary(input.script_sig.to_bytes()),
                        InputWitness => Payload::Object(json!(input
                            .witness
                            .iter()
                            .map(|item| item.to_hex())
                            .collect::<Vec<String>>())),
                        _ => unreachable!(),
                    }
                }
            }
        }

        Outputs | Output | OutputScript | OutputSpender | OutputSpenders => {
            let txid = param_txid(params)?;
            let tx = query.get_transaction(&txid)?;
            match method {
                Outputs => Payload::Object(json!(tx
                    .output
                    .iter()
                    .map(output_json)
                    .collect::<Vec<Value>>())),
                OutputSpenders => {
                    let spenders: Vec<Value> = (0..tx.output.len() as u32)
                        .filter_map(|vout| {
                            query
                                .get_spender(&bitcoin::OutPoint::new(txid, vout))
                                .map(|spender| json!({ "vout": vout, "tx_hash": spender.to_string() }))
                        })
                        .collect();
                    Payload::Object(json!(spenders))
                }
                _ => {
                    let index = param_index(params)?;
                    let output = tx
                        .output
                        .get(index as usize)
                        .ok_or(GatewayError::NotFound)?;
                    match method {
                        Output => Payload::Object(output_json(output)),
                        OutputScript => Payload::Binary(output.script_pubkey.to_bytes()),
                        OutputSpender => {
                            let spender = query.get_spender(&bitcoin::OutPoint::new(txid, index));
                            Payload::Object(json!(spender.map(|txid| txid.to_string())))
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }

        Block | BlockHeader | BlockHeaderContext | BlockTxs | BlockDetails | BlockTx
        | BlockFilter | BlockFilterHash | BlockFilterHeader => {
            let block_hash = param_block_hash(query, params)?;
            match method {
                Block => Payload::Binary(query.get_block_raw(&block_hash)?),
                BlockHeader => {
                    let hex = query.get_header_hex(&block_hash)?;
                    Payload::Binary(Vec::<u8>::from_hex(&hex).map_err(|_| GatewayError::ServerError)?)
                }
                BlockHeaderContext => Payload::Object(query.get_header_info(&block_hash)?),
                BlockTxs => {
                    let txids = query.get_block_txids(&block_hash)?;
                    Payload::Object(json!(txids
                        .iter()
                        .map(|txid| txid.to_string())
                        .collect::<Vec<String>>()))
                }
                BlockDetails => Payload::Object(query.get_block_info(&block_hash)?),
                BlockTx => {
                    let txids = query.get_block_txids(&block_hash)?;
                    let position = params.position.unwrap_or(0) as usize;
                    let txid = txids.get(position).ok_or(GatewayError::NotFound)?;
                    let tx = query.get_transaction(txid)?;
                    Payload::Binary(serialize_tx(&tx, params.witness))
                }
                BlockFilter | BlockFilterHash | BlockFilterHeader => {
                    // only BIP158 basic filters exist
                    if params.filter_type != Some(0) {
                        bail!(GatewayError::NotImplemented);
                    }
                    let info = query.get_block_filter(&block_hash)?;
                    match method {
                        BlockFilter => {
                            let filter = info["filter"].as_str().ok_or(GatewayError::NotFound)?;
                            Payload::Binary(
                                Vec::<u8>::from_hex(filter)
                                    .map_err(|_| GatewayError::ServerError)?,
                            )
                        }
                        BlockFilterHash => {
                            let filter = info["filter"].as_str().ok_or(GatewayError::NotFound)?;
                            let bytes = Vec::<u8>::from_hex(filter)
                                .map_err(|_| GatewayError::ServerError)?;
                            let hash = bitcoin_hashes::sha256d::Hash::hash(&bytes);
                            Payload::Object(json!(hash.into_inner().to_hex()))
                        }
                        BlockFilterHeader => {
                            let header = info["header"].as_str().ok_or(GatewayError::NotFound)?;
                            Payload::Object(json!(header))
                        }
                        _ => unreachable!(),
                    }
                }
                _ => unreachable!(),
            }
        }
    };

    Ok(finish(payload, media))
}

fn param_scripthash(params: &NativeParams) -> std::result::Result<ScriptHash, GatewayError> {
    let hash = params.hash.ok_or(GatewayError::MissingHash)?;
    ScriptHash::from_slice(&hash).map_err(|_| GatewayError::InvalidHash)
}

fn param_txid(params: &NativeParams) -> std::result::Result<Txid, GatewayError> {
    let hash = params.hash.ok_or(GatewayError::MissingHash)?;
    Txid::from_slice(&hash).map_err(|_| GatewayError::InvalidHash)
}

fn param_index(params: &NativeParams) -> std::result::Result<u32, GatewayError> {
    params.index.ok_or(GatewayError::MissingPosition)
}

fn param_block_hash(query: &Query, params: &NativeParams) -> Result<BlockHash> {
    match (params.hash, params.height) {
        (Some(hash), _) => Ok(BlockHash::from_slice(&hash).map_err(|_| GatewayError::InvalidHash)?),
        (None, Some(height)) => query.get_block_hash(height),
        (None, None) => Err(GatewayError::MissingHash.into()),
    }
}

fn input_json(input: &bitcoin::TxIn) -> Value {
    json!({
        "previous_output": {
            "hash": input.previous_output.txid.to_string(),
            "index": input.previous_output.vout,
        },
        "script": input.script_sig.to_bytes().to_hex(),
        "sequence": input.sequence,
        "witness": input.witness.iter().map(|item| item.to_hex()).collect::<Vec<String>>(),
    })
}

fn output_json(output: &bitcoin::TxOut) -> Value {
    json!({
        "value": output.value,
        "script": output.script_pubkey.to_bytes().to_hex(),
    })
}

/// Map an execution failure onto the REST response envelope.
pub fn error_to_response(err: &crate::error::Error) -> NativeResponse {
    let cause = gateway_error(err).unwrap_or(GatewayError::ServerError);
    NativeResponse {
        status: cause.http_status(),
        content_type: "text/plain",
        body: cause.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    fn parse(path: &str) -> (NativeMethod, NativeParams) {
        parse_target(path).unwrap()
    }

    fn parse_err(path: &str) -> GatewayError {
        parse_target(path).unwrap_err()
    }

    #[test]
    fn parses_the_full_grammar() {
        use NativeMethod::*;
        let cases: Vec<(String, NativeMethod)> = vec![
            ("/v1/top".into(), Top),
            (format!("/v1/address/{}", HASH), Address),
            (format!("/v1/address/{}/confirmed", HASH), AddressConfirmed),
            (format!("/v1/address/{}/unconfirmed", HASH), AddressUnconfirmed),
            (format!("/v1/address/{}/balance", HASH), AddressBalance),
            (format!("/v1/tx/{}", HASH), Tx),
            (format!("/v1/tx/{}/header", HASH), TxHeader),
            (format!("/v1/tx/{}/details", HASH), TxDetails),
            (format!("/v1/input/{}", HASH), Inputs),
            (format!("/v1/input/{}/0", HASH), Input),
            (format!("/v1/input/{}/3/script", HASH), InputScript),
            (format!("/v1/input/{}/3/witness", HASH), InputWitness),
            (format!("/v1/output/{}", HASH), Outputs),
            (format!("/v1/output/{}/2", HASH), Output),
            (format!("/v1/output/{}/2/script", HASH), OutputScript),
            (format!("/v1/output/{}/2/spender", HASH), OutputSpender),
            (format!("/v1/output/{}/2/spenders", HASH), OutputSpenders),
            (format!("/v1/block/hash/{}", HASH), Block),
            ("/v1/block/height/0".into(), Block),
            ("/v1/block/height/100/header".into(), BlockHeader),
            ("/v1/block/height/100/header/context".into(), BlockHeaderContext),
            ("/v1/block/height/100/txs".into(), BlockTxs),
            ("/v1/block/height/100/details".into(), BlockDetails),
            ("/v1/block/height/100/tx/4".into(), BlockTx),
            ("/v1/block/height/100/filter/0".into(), BlockFilter),
            ("/v1/block/height/100/filter/0/hash".into(), BlockFilterHash),
            ("/v1/block/height/100/filter/0/header".into(), BlockFilterHeader),
        ];
        for (path, expected) in cases {
            let (method, _) = parse(&path);
            assert_eq!(method, expected, "path {}", path);
        }
    }

    #[test]
    fn round_trips_every_method() {
        let paths = [
            "/v1/top".to_string(),
            format!("/v2/address/{}/balance", HASH),
            format!("/v1/tx/{}/details", HASH),
            format!("/v1/input/{}/3/script", HASH),
            format!("/v1/output/{}/2/spenders", HASH),
            format!("/v1/block/hash/{}/filter/0/header", HASH),
            "/v1/block/height/100/tx/4".to_string(),
        ];
        for path in &paths {
            let (method, params) = parse(path);
            assert_eq!(&encode_target(method, &params), path, "path {}", path);
        }
    }

    #[test]
    fn rejects_malformed_paths_with_specific_errors() {
        use GatewayError::*;
        assert_eq!(parse_err("/"), EmptyPath);
        assert_eq!(parse_err("/top"), MissingVersion);
        assert_eq!(parse_err("/v1"), MissingTarget);
        assert_eq!(parse_err("/v01/top"), InvalidNumber);
        assert_eq!(parse_err("/v1/nope"), InvalidTarget);
        assert_eq!(parse_err("/v1/tx"), MissingHash);
        // an empty hash segment collapses, making the next token the hash
        assert_eq!(parse_err("/v1/tx//header"), InvalidHash);
        assert_eq!(parse_err(&format!("/v1/tx/{}/nope", HASH)), InvalidComponent);
        assert_eq!(
            parse_err(&format!("/v1/address/{}/nope", HASH)),
            InvalidSubcomponent
        );
        assert_eq!(parse_err("/v1/block"), MissingIdType);
        assert_eq!(parse_err("/v1/block/nope"), InvalidIdType);
        assert_eq!(parse_err("/v1/block/height"), MissingHeight);
        assert_eq!(parse_err("/v1/block/height/007"), InvalidNumber);
        assert_eq!(parse_err("/v1/block/height/1/tx"), MissingPosition);
        assert_eq!(parse_err("/v1/block/height/1/filter"), MissingTypeId);
        assert_eq!(parse_err("/v1/top/extra"), ExtraSegment);
        let upper = HASH.to_uppercase();
        assert_eq!(parse_err(&format!("/v1/tx/{}", upper)), InvalidHash);
    }

    #[test]
    fn numbers_allow_a_lone_zero() {
        assert_eq!(parse("/v1/block/height/0").1.height, Some(0));
        assert_eq!(parse_err("/v1/block/height/00"), GatewayError::InvalidNumber);
    }

    #[test]
    fn query_modifiers_and_media() {
        let mut params = NativeParams::default();
        parse_query("format=text&witness=false", None, &mut params)
            .unwrap()
            .unwrap();
        assert_eq!(params.media, Media::Text);
        assert!(!params.witness);

        // format beats the accept header
        let mut params = NativeParams::default();
        parse_query("format=data", Some("text/html"), &mut params)
            .unwrap()
            .unwrap();
        assert_eq!(params.media, Media::Data);

        // accept priority: json > html > text > data
        let mut params = NativeParams::default();
        parse_query("", Some("text/plain, text/html"), &mut params)
            .unwrap()
            .unwrap();
        assert_eq!(params.media, Media::Html);

        // no acceptable media
        let mut params = NativeParams::default();
        assert_eq!(parse_query("", Some("image/png"), &mut params).unwrap(), None);

        // default is json
        let mut params = NativeParams::default();
        parse_query("", None, &mut params).unwrap().unwrap();
        assert_eq!(params.media, Media::Json);

        // malformed booleans are rejected
        let mut params = NativeParams::default();
        assert_eq!(
            parse_query("witness=maybe", None, &mut params).unwrap_err(),
            GatewayError::InvalidArgument
        );
    }

    #[test]
    fn hash_parsing_reverses_byte_order() {
        let (_, params) = parse(&format!("/v1/tx/{}", HASH));
        let txid = param_txid(&params).unwrap();
        assert_eq!(txid.to_string(), HASH);
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Block, BlockHash, Network, OutPoint, Transaction, Txid};
use bitcoin_hashes::hex::FromHex;
use serde_json::Value;

use bitcoincore_rpc::{Client as RpcClient, RpcApi};

use crate::error::{Context, OptionExt, Result};
use crate::notifier::script_hash_field;
use crate::types::{
    BlockFees, BlockId, HistoryEntry, ScriptHash, StatusHash, TxFeeRate, TxStatus, Utxo,
};

const LT: &str = "bsg::query";

/// Read-only chain/mempool accessors the protocols run against, plus the
/// session-scoped script index that backs history, balance and spender
/// lookups. Everything confirmed before the gateway started comes straight
/// from bitcoind; script histories accumulate from the blocks and mempool
/// transactions observed while running.
pub struct Query {
    rpc: Arc<RpcClient>,
    network: Network,
    index: RwLock<ScriptIndex>,
}

#[derive(Debug, Clone)]
struct TxoEntry {
    scripthash: ScriptHash,
    value: u64,
    status: TxStatus,
}

#[derive(Default)]
struct ScriptIndex {
    history: HashMap<ScriptHash, BTreeSet<HistoryEntry>>,
    txos: HashMap<OutPoint, TxoEntry>,
    spent: HashMap<OutPoint, Txid>,
}

impl ScriptIndex {
    fn index_tx(&mut self, tx: &Transaction, status: TxStatus) {
        let txid = tx.txid();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.is_provably_unspendable() {
                continue;
            }
            let scripthash = to_scripthash(&output.script_pubkey);
            let history = self.history.entry(scripthash).or_default();
            history.remove(&HistoryEntry {
                txid,
                status: TxStatus::Unconfirmed,
            });
            history.insert(HistoryEntry { txid, status });
            self.txos.insert(
                OutPoint::new(txid, vout as u32),
                TxoEntry {
                    scripthash,
                    value: output.value,
                    status,
                },
            );
        }
        for input in &tx.input {
            if input.previous_output.is_null() {
                continue;
            }
            self.spent.insert(input.previous_output, txid);
            // spending also touches the funded script's history
            if let Some(txo) = self.txos.get(&input.previous_output) {
                let history = self.history.entry(txo.scripthash).or_default();
                history.remove(&HistoryEntry {
                    txid,
                    status: TxStatus::Unconfirmed,
                });
                history.insert(HistoryEntry { txid, status });
            }
        }
    }

    fn unindex_block(&mut self, height: u32, block: &Block) {
        let status = TxStatus::Confirmed(height);
        for tx in &block.txdata {
            let txid = tx.txid();
            for (vout, _) in tx.output.iter().enumerate() {
                self.txos.remove(&OutPoint::new(txid, vout as u32));
            }
            for input in &tx.input {
                self.spent.remove(&input.previous_output);
            }
            for history in self.history.values_mut() {
                history.remove(&HistoryEntry { txid, status });
            }
        }
        self.history.retain(|_, history| !history.is_empty());
    }
}

fn to_scripthash(script: &bitcoin::Script) -> ScriptHash {
    use bitcoin_hashes::Hash;
    ScriptHash::from_slice(&script_hash_field(script)).unwrap()
}

impl Query {
    pub fn new(rpc: Arc<RpcClient>, network: Network) -> Self {
        Query {
            rpc,
            network,
            index: RwLock::new(ScriptIndex::default()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // Chain accessors.
    // ------------------------------------------------------------------------

    pub fn get_tip(&self) -> Result<BlockId> {
        let height = self.get_tip_height()?;
        let hash = self.get_block_hash(height)?;
        Ok(BlockId(height, hash))
    }

    pub fn get_tip_height(&self) -> Result<u32> {
        Ok(self.rpc.get_block_count()? as u32)
    }

    /// C1's `get_top_confirmed`.
    pub fn get_top_confirmed(&self) -> Result<u32> {
        self.get_tip_height()
    }

    pub fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        Ok(self.rpc.get_block_hash(height as u64)?)
    }

    pub fn get_header_hex(&self, hash: &BlockHash) -> Result<String> {
        Ok(self.rpc.call("getblockheader", &[json!(hash), false.into()])?)
    }

    pub fn get_header(&self, height: u32) -> Result<String> {
        let hash = self.get_block_hash(height)?;
        self.get_header_hex(&hash)
    }

    pub fn get_headers(&self, heights: &[u32]) -> Result<Vec<String>> {
        heights.iter().map(|height| self.get_header(*height)).collect()
    }

    /// Verbose header (confirmations, chain context).
    pub fn get_header_info(&self, hash: &BlockHash) -> Result<Value> {
        Ok(self.rpc.call("getblockheader", &[json!(hash), true.into()])?)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Block> {
        let hex: String = self.rpc.call("getblock", &[json!(hash), 0.into()])?;
        let bytes = Vec::<u8>::from_hex(&hex).context("invalid block hex")?;
        Ok(deserialize(&bytes).context("invalid block")?)
    }

    pub fn get_block_raw(&self, hash: &BlockHash) -> Result<Vec<u8>> {
        let hex: String = self.rpc.call("getblock", &[json!(hash), 0.into()])?;
        Ok(Vec::<u8>::from_hex(&hex).context("invalid block hex")?)
    }

    /// getblock verbosity 1: txids plus context.
    pub fn get_block_info(&self, hash: &BlockHash) -> Result<Value> {
        Ok(self.rpc.call("getblock", &[json!(hash), 1.into()])?)
    }

    pub fn get_block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>> {
        let info = self.get_block_info(hash)?;
        let txids = info["tx"].as_array().or_err("invalid getblock reply")?;
        txids
            .iter()
            .map(|txid| {
                let txid = txid.as_str().or_err("invalid txid entry")?;
                Ok(txid.parse()?)
            })
            .collect()
    }

    // Transactions.
    // ------------------------------------------------------------------------

    pub fn get_tx_hex(&self, txid: &Txid) -> Result<String> {
        Ok(self.rpc.call("getrawtransaction", &[json!(txid)])?)
    }

    pub fn get_tx_raw(&self, txid: &Txid) -> Result<Vec<u8>> {
        let hex = self.get_tx_hex(txid)?;
        Ok(Vec::<u8>::from_hex(&hex).context("invalid tx hex")?)
    }

    pub fn get_transaction(&self, txid: &Txid) -> Result<Transaction> {
        Ok(deserialize(&self.get_tx_raw(txid)?).context("invalid tx")?)
    }

    pub fn get_tx_json(&self, txid: &Txid) -> Result<Value> {
        Ok(self.rpc.call("getrawtransaction", &[json!(txid), true.into()])?)
    }

    pub fn broadcast(&self, tx_hex: &str) -> Result<Txid> {
        Ok(self.rpc.send_raw_transaction(tx_hex)?)
    }

    // Mempool.
    // ------------------------------------------------------------------------

    pub fn get_raw_mempool(&self) -> Result<Value> {
        Ok(self.rpc.call("getrawmempool", &[true.into()])?)
    }

    pub fn get_mempool_txids(&self) -> Result<Vec<Txid>> {
        Ok(self.rpc.get_raw_mempool()?)
    }

    /// Relay fee in sat/vB.
    pub fn relay_fee(&self) -> Result<f64> {
        let info: Value = self.rpc.call("getnetworkinfo", &[])?;
        let btc_per_kvb = info["relayfee"].as_f64().or_err("invalid getnetworkinfo reply")?;
        Ok(btc_per_kvb * 100_000_000.0 / 1000.0)
    }

    // Fee-rate sets for the estimator (C1's get_block_fees).
    // ------------------------------------------------------------------------

    /// Per-tx `(fee, vsize)` of the block at `height`, coinbase excluded.
    pub fn get_block_fees_at(&self, height: u32) -> Result<BlockFees> {
        let hash = self.get_block_hash(height)?;
        self.get_block_fees(&hash)
    }

    /// By hash, which keeps working for blocks reorganized off the main
    /// chain. Requires a bitcoind recent enough to include `fee` at
    /// verbosity 2; transactions without the field count as zero-fee and
    /// are skipped by the estimator.
    pub fn get_block_fees(&self, hash: &BlockHash) -> Result<BlockFees> {
        let verbose: Value = self.rpc.call("getblock", &[json!(hash), 2.into()])?;
        let txs = verbose["tx"].as_array().or_err("invalid getblock reply")?;
        Ok(txs
            .iter()
            .skip(1) // coinbase
            .map(|tx| {
                let fee_btc = tx["fee"].as_f64().unwrap_or(0.0);
                let vsize = tx["vsize"].as_u64().or_else(|| tx["size"].as_u64()).unwrap_or(0);
                TxFeeRate {
                    fee: (fee_btc * 100_000_000.0).round() as u64,
                    bytes: vsize as u32,
                }
            })
            .filter(|rate| rate.bytes > 0)
            .collect())
    }

    // Node info passthrough for the bitcoind protocol.
    // ------------------------------------------------------------------------

    pub fn get_blockchain_info(&self) -> Result<Value> {
        Ok(self.rpc.call("getblockchaininfo", &[])?)
    }

    pub fn get_network_info(&self) -> Result<Value> {
        Ok(self.rpc.call("getnetworkinfo", &[])?)
    }

    pub fn get_block_template(&self) -> Result<Value> {
        Ok(self
            .rpc
            .call("getblocktemplate", &[json!({ "rules": ["segwit"] })])?)
    }

    /// BIP158 basic filter, when bitcoind runs with -blockfilterindex.
    pub fn get_block_filter(&self, hash: &BlockHash) -> Result<Value> {
        Ok(self.rpc.call("getblockfilter", &[json!(hash)])?)
    }

    // Script index.
    // ------------------------------------------------------------------------

    pub fn index_block(&self, height: u32, block: &Block) {
        let mut index = self.index.write().unwrap();
        for tx in &block.txdata {
            index.index_tx(tx, TxStatus::Confirmed(height));
        }
        trace!(target: LT, "indexed block {} ({} txs)", height, block.txdata.len());
    }

    pub fn unindex_block(&self, height: u32, block: &Block) {
        self.index.write().unwrap().unindex_block(height, block);
    }

    pub fn index_mempool_tx(&self, tx: &Transaction) {
        self.index.write().unwrap().index_tx(tx, TxStatus::Unconfirmed);
    }

    /// C1's `fetch_history`: visit the known history entries of a script,
    /// confirmed in chain order with mempool entries last.
    pub fn map_history<T>(
        &self,
        scripthash: &ScriptHash,
        f: impl FnMut(&HistoryEntry) -> T,
    ) -> Vec<T> {
        self.ordered_history(scripthash).iter().map(f).collect()
    }

    pub fn get_history(&self, scripthash: &ScriptHash) -> Vec<HistoryEntry> {
        self.ordered_history(scripthash)
    }

    fn ordered_history(&self, scripthash: &ScriptHash) -> Vec<HistoryEntry> {
        let index = self.index.read().unwrap();
        let history = match index.history.get(scripthash) {
            Some(history) => history,
            None => return Vec::new(),
        };
        // ascending set order is [unconfirmed, confirmed by height]; electrum
        // wants confirmed first, mempool entries last
        let (confirmed, mempool): (Vec<HistoryEntry>, Vec<HistoryEntry>) = history
            .iter()
            .filter(|entry| entry.status.is_viable())
            .cloned()
            .partition(|entry| entry.status.is_confirmed());
        confirmed.into_iter().chain(mempool).collect()
    }

    /// History string hashed into the electrum status hash; `None` for
    /// scripts with no known history.
    pub fn get_status_hash(&self, scripthash: &ScriptHash) -> Option<StatusHash> {
        use bitcoin_hashes::Hash;
        let history = self.ordered_history(scripthash);
        if history.is_empty() {
            return None;
        }
        let joined: String = history
            .iter()
            .map(|entry| format!("{}:{}:", entry.txid, entry.status.electrum_height()))
            .collect();
        Some(StatusHash::hash(joined.as_bytes()))
    }

    pub fn get_script_balance(&self, scripthash: &ScriptHash) -> (u64, u64) {
        let index = self.index.read().unwrap();
        let mut confirmed = 0u64;
        let mut unconfirmed = 0u64;
        for (outpoint, txo) in &index.txos {
            if txo.scripthash != *scripthash || index.spent.contains_key(outpoint) {
                continue;
            }
            match txo.status {
                TxStatus::Confirmed(_) => confirmed += txo.value,
                TxStatus::Unconfirmed => unconfirmed += txo.value,
                TxStatus::Conflicted => (),
            }
        }
        (confirmed, unconfirmed)
    }

    pub fn list_unspent(&self, scripthash: &ScriptHash) -> Vec<Utxo> {
        let index = self.index.read().unwrap();
        let mut utxos: Vec<Utxo> = index
            .txos
            .iter()
            .filter(|(outpoint, txo)| {
                txo.scripthash == *scripthash && !index.spent.contains_key(outpoint)
            })
            .map(|(outpoint, txo)| Utxo {
                txid: outpoint.txid,
                vout: outpoint.vout,
                value: txo.value,
                status: txo.status,
            })
            .collect();
        utxos.sort_by_key(|utxo| (utxo.status, utxo.txid, utxo.vout));
        utxos
    }

    pub fn get_spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.index.read().unwrap().spent.get(outpoint).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::TxOut;

    fn dummy_tx(value: u64, script: bitcoin::Script) -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![],
            output: vec![TxOut {
                value,
                script_pubkey: script,
            }],
        }
    }

    #[test]
    fn index_tracks_history_and_balance() {
        let mut index = ScriptIndex::default();
        let script = bitcoin::Script::from(vec![0x51]); // OP_TRUE script
        let scripthash = to_scripthash(&script);

        let tx = dummy_tx(5000, script.clone());
        index.index_tx(&tx, TxStatus::Unconfirmed);
        assert_eq!(index.history[&scripthash].len(), 1);

        // confirmation supersedes the unconfirmed entry
        index.index_tx(&tx, TxStatus::Confirmed(100));
        assert_eq!(index.history[&scripthash].len(), 1);
        assert!(index.history[&scripthash]
            .iter()
            .all(|entry| entry.status == TxStatus::Confirmed(100)));
    }
}

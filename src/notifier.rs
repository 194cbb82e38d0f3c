use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bitcoin::blockdata::script::{Instruction, Script};
use bitcoin::consensus::encode::serialize;
use bitcoin::{Block, BlockHash, Transaction, TxIn};
use bitcoin_hashes::{hash160, hex::ToHex, Hash};
use serde_json::Value;

use crate::error::GatewayError;
use crate::events::ChainEvent;
use crate::types::{Binary, ScriptHash};
use crate::util::{spawn_thread, ShutdownToken};

const LT: &str = "bsg::notifier";

// Purge subscriptions at 10% of the expiration period.
const PURGE_INTERVAL_RATIO: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    AddressPrefix,
    ScriptHashStatus,
    Header,
    TxAccepted,
    MiningJob,
    PenetrationTrack,
}

/// One outbound notification, shaped after the bus payload
/// `[code:4][sequence:1][height:4][block_hash:32][tx:...]`. The JSON
/// protocols serialize the equivalent object.
#[derive(Clone, Debug)]
pub struct Notification {
    /// 0 for success, else the drop cause.
    pub code: u32,
    pub kind: SubscriptionKind,
    pub selector: Binary,
    pub sequence: u8,
    /// 0 for mempool events.
    pub height: u32,
    /// Zeroed for mempool events.
    pub block_hash: BlockHash,
    pub tx: Option<Arc<Transaction>>,
}

impl Notification {
    pub fn to_json(&self, witness: bool) -> Value {
        json!({
            "code": self.code,
            "kind": self.kind,
            "selector": self.selector,
            "sequence": self.sequence,
            "height": self.height,
            "block_hash": self.block_hash,
            "tx": self.tx.as_ref().map(|tx| serialize_tx(tx, witness).to_hex()),
        })
    }
}

/// Canonical serialization, with the witness data stripped when the channel
/// asked for base encoding.
pub fn serialize_tx(tx: &Transaction, witness: bool) -> Vec<u8> {
    if witness {
        serialize(tx)
    } else {
        let mut stripped = tx.clone();
        for input in &mut stripped.input {
            input.witness.clear();
        }
        serialize(&stripped)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SinkError {
    Overflow,
    Closed,
}

/// The write half a route delivers through; implemented by each transport's
/// channel. Must never block: a filled queue reports `Overflow`.
pub trait NotifySink: Send + Sync {
    fn notify(&self, notification: &Notification) -> std::result::Result<(), SinkError>;
}

/// Reply destination for notifications. The id is the owning channel's
/// identifier; the engine drops all routes of a channel when it closes.
#[derive(Clone)]
pub struct Route {
    pub id: u64,
    sink: Arc<dyn NotifySink>,
}

impl Route {
    pub fn new(id: u64, sink: Arc<dyn NotifySink>) -> Self {
        Route { id, sink }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Route({})", self.id)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct SubKey {
    route: u64,
    kind: SubscriptionKind,
    selector: Binary,
}

struct SubEntry {
    route: Route,
    expiry: Instant,
    sequence: Arc<AtomicU8>,
}

/// The subscription table and its event fan-out.
///
/// Writers are subscribe/unsubscribe/purge, readers are the event matchers;
/// matching collects a snapshot under the shared lock and sends after
/// releasing it.
pub struct Notifier {
    subs: RwLock<HashMap<SubKey, SubEntry>>,
    /// Routes whose sink failed; their subscriptions go at the next purge.
    dead_routes: Mutex<HashSet<u64>>,
    limit: usize,
    lease: Duration,
}

impl Notifier {
    pub fn new(limit: usize, lease: Duration) -> Self {
        Notifier {
            subs: RwLock::new(HashMap::new()),
            dead_routes: Mutex::new(HashSet::new()),
            limit,
            lease,
        }
    }

    /// Spawn the periodic purge sweep, at a tenth of the lease (capped at a
    /// 31 bit millisecond value).
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownToken) {
        let notifier = Arc::clone(self);
        let shutdown = shutdown.clone();
        let interval = self.purge_interval();
        spawn_thread("notifier-purge", move || loop {
            if shutdown.wait_timeout(interval) {
                notifier.stop();
                return;
            }
            notifier.purge();
        });
    }

    fn purge_interval(&self) -> Duration {
        let millis = self.lease.as_millis() / u128::from(PURGE_INTERVAL_RATIO);
        Duration::from_millis(millis.min(i32::MAX as u128) as u64)
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.read().unwrap().len()
    }

    /// Insert or renew. A repeat subscribe for the same
    /// `(route, kind, selector)` renews the lease and resets the sequence.
    pub fn subscribe(
        &self,
        route: Route,
        kind: SubscriptionKind,
        selector: Binary,
    ) -> std::result::Result<(), GatewayError> {
        let key = SubKey {
            route: route.id,
            kind,
            selector,
        };
        let expiry = Instant::now() + self.lease;
        let mut subs = self.subs.write().unwrap();
        if let Some(entry) = subs.get_mut(&key) {
            entry.expiry = expiry;
            entry.sequence.store(0, Ordering::SeqCst);
            entry.route = route;
            return Ok(());
        }
        if subs.len() >= self.limit {
            return Err(GatewayError::PoolFilled);
        }
        subs.insert(
            key,
            SubEntry {
                route,
                expiry,
                sequence: Arc::new(AtomicU8::new(0)),
            },
        );
        Ok(())
    }

    /// Remove, delivering one final `channel_stopped` notification to the
    /// owner. Unsubscribing something absent is a no-op; returns whether the
    /// subscription existed.
    pub fn unsubscribe(&self, route_id: u64, kind: SubscriptionKind, selector: Binary) -> bool {
        let key = SubKey {
            route: route_id,
            kind,
            selector,
        };
        let removed = self.subs.write().unwrap().remove(&key);
        match removed {
            Some(entry) => {
                self.send_final(&entry, &key, GatewayError::ChannelStopped);
                true
            }
            None => false,
        }
    }

    /// Extend the lease of an existing subscription; absent is a no-op.
    pub fn renew(&self, route_id: u64, kind: SubscriptionKind, selector: Binary) {
        let key = SubKey {
            route: route_id,
            kind,
            selector,
        };
        if let Some(entry) = self.subs.write().unwrap().get_mut(&key) {
            entry.expiry = Instant::now() + self.lease;
        }
    }

    /// Atomically drop everything a closed channel owns, without final
    /// notifications (there is nowhere to send them).
    pub fn unsubscribe_route(&self, route_id: u64) {
        self.subs.write().unwrap().retain(|key, _| key.route != route_id);
        self.dead_routes.lock().unwrap().remove(&route_id);
    }

    /// Periodic sweep: expired entries get a final `channel_timeout`
    /// notification, dead routes lose all their subscriptions.
    pub fn purge(&self) {
        let now = Instant::now();
        let dead: HashSet<u64> = self.dead_routes.lock().unwrap().drain().collect();

        let mut expired = Vec::new();
        {
            let mut subs = self.subs.write().unwrap();
            let keys: Vec<SubKey> = subs
                .iter()
                .filter(|(key, entry)| entry.expiry <= now || dead.contains(&key.route))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = subs.remove(&key) {
                    let timed_out = entry.expiry <= now && !dead.contains(&key.route);
                    expired.push((key, entry, timed_out));
                }
            }
        }

        if !expired.is_empty() {
            debug!(target: LT, "purged {} subscription(s)", expired.len());
        }
        for (key, entry, timed_out) in expired {
            if timed_out {
                self.send_final(&entry, &key, GatewayError::ChannelTimeout);
            }
        }
    }

    /// Final shutdown: everything gets a `channel_stopped` notification.
    pub fn stop(&self) {
        let drained: Vec<(SubKey, SubEntry)> = self.subs.write().unwrap().drain().collect();
        for (key, entry) in drained {
            self.send_final(&entry, &key, GatewayError::ChannelStopped);
        }
    }

    fn send_final(&self, entry: &SubEntry, key: &SubKey, cause: GatewayError) {
        let notification = Notification {
            code: cause.code(),
            kind: key.kind,
            selector: key.selector.clone(),
            sequence: entry.sequence.load(Ordering::SeqCst),
            height: 0,
            block_hash: Default::default(),
            tx: None,
        };
        // best effort, the channel may be long gone
        let _ = entry.route.sink.notify(&notification);
    }

    /// Feed one bus event through the table.
    pub fn on_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockConnected {
                height,
                hash,
                block,
            } => self.notify_block(*height, *hash, block),
            ChainEvent::TxAccepted { tx } => {
                self.notify_transaction(0, Default::default(), tx, true)
            }
            ChainEvent::Stop => self.stop(),
            _ => (),
        }
    }

    fn notify_block(&self, height: u32, hash: BlockHash, block: &Block) {
        // headers and mining jobs match any connected block
        self.notify_kind(SubscriptionKind::Header, height, hash, None);
        self.notify_kind(SubscriptionKind::MiningJob, height, hash, None);

        for tx in &block.txdata {
            self.notify_transaction(height, hash, &Arc::new(tx.clone()), false);
        }
    }

    /// Fan out to every subscription of `kind`, regardless of selector.
    fn notify_kind(
        &self,
        kind: SubscriptionKind,
        height: u32,
        block_hash: BlockHash,
        tx: Option<&Arc<Transaction>>,
    ) {
        let matches = self.collect(|key, _| key.kind == kind);
        self.send_all(matches, height, block_hash, tx);
    }

    fn notify_transaction(
        &self,
        height: u32,
        block_hash: BlockHash,
        tx: &Arc<Transaction>,
        mempool: bool,
    ) {
        // address fields from inputs and outputs
        for input in &tx.input {
            if let Some(field) = input_address_field(input) {
                self.notify_field(SubscriptionKind::AddressPrefix, &field, height, block_hash, tx);
            }
        }
        for output in &tx.output {
            if let Some(field) = script_address_field(&output.script_pubkey) {
                self.notify_field(SubscriptionKind::AddressPrefix, &field, height, block_hash, tx);
            }
        }

        // electrum-style script hashes from outputs
        for output in &tx.output {
            let field = script_hash_field(&output.script_pubkey);
            self.notify_field(
                SubscriptionKind::ScriptHashStatus,
                &field,
                height,
                block_hash,
                tx,
            );
            if mempool {
                // TxAccepted selectors are script hash prefixes (empty = all)
                self.notify_field(SubscriptionKind::TxAccepted, &field, height, block_hash, tx);
            }
        }

        // penetration tracking keys on the tx hash, wherever it appears
        let txid_field: Vec<u8> = tx.txid().into_inner().to_vec();
        self.notify_field(
            SubscriptionKind::PenetrationTrack,
            &txid_field,
            height,
            block_hash,
            tx,
        );
    }

    fn notify_field(
        &self,
        kind: SubscriptionKind,
        field: &[u8],
        height: u32,
        block_hash: BlockHash,
        tx: &Arc<Transaction>,
    ) {
        let matches = self.collect(|key, _| key.kind == kind && key.selector.is_prefix_of(field));
        self.send_all(matches, height, block_hash, Some(tx));
    }

    /// Snapshot the matching routes under the shared lock.
    fn collect(
        &self,
        matcher: impl Fn(&SubKey, &SubEntry) -> bool,
    ) -> Vec<(SubKey, Route, Arc<AtomicU8>)> {
        self.subs
            .read()
            .unwrap()
            .iter()
            .filter(|(key, entry)| matcher(key, entry))
            .map(|(key, entry)| (key.clone(), entry.route.clone(), Arc::clone(&entry.sequence)))
            .collect()
    }

    /// Deliver outside any lock, each send on the target channel's strand
    /// (the sink enqueues onto the channel's writer queue).
    fn send_all(
        &self,
        matches: Vec<(SubKey, Route, Arc<AtomicU8>)>,
        height: u32,
        block_hash: BlockHash,
        tx: Option<&Arc<Transaction>>,
    ) {
        for (key, route, sequence) in matches {
            let notification = Notification {
                code: 0,
                kind: key.kind,
                selector: key.selector.clone(),
                sequence: sequence.fetch_add(1, Ordering::SeqCst),
                height,
                block_hash,
                tx: tx.cloned(),
            };
            match route.sink.notify(&notification) {
                Ok(()) => (),
                Err(SinkError::Overflow) => {
                    warn!(target: LT, "route {} overflowed, scheduling removal", route.id);
                    self.dead_routes.lock().unwrap().insert(route.id);
                }
                Err(SinkError::Closed) => {
                    trace!(target: LT, "route {} closed, scheduling removal", route.id);
                    self.dead_routes.lock().unwrap().insert(route.id);
                }
            }
        }
    }
}

// Field extraction.
// ----------------------------------------------------------------------------

/// The 160 bit payment address hash of common output scripts (256 bit for
/// v0 witness script hashes).
pub fn script_address_field(script: &Script) -> Option<Vec<u8>> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        Some(bytes[3..23].to_vec())
    } else if script.is_p2sh() {
        Some(bytes[2..22].to_vec())
    } else if script.is_v0_p2wpkh() {
        Some(bytes[2..22].to_vec())
    } else if script.is_v0_p2wsh() {
        Some(bytes[2..34].to_vec())
    } else {
        None
    }
}

/// Recover the spender's address hash from a p2pkh-style signature script
/// (its final push is the public key).
pub fn input_address_field(input: &TxIn) -> Option<Vec<u8>> {
    let last_push = input
        .script_sig
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(data)) => Some(data.to_vec()),
            _ => None,
        })
        .last()?;
    if last_push.len() == 33 || last_push.len() == 65 {
        Some(hash160::Hash::hash(&last_push).into_inner().to_vec())
    } else {
        None
    }
}

/// The electrum-convention script hash (sha256 of the spk), in digest order.
pub fn script_hash_field(script: &Script) -> Vec<u8> {
    ScriptHash::hash(script.as_bytes()).into_inner().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::block::BlockHeader;
    use bitcoin::util::address::{Address, Payload};
    use bitcoin::{Network, OutPoint, PubkeyHash, TxOut};

    struct TestSink {
        sent: Mutex<Vec<Notification>>,
        fail: Option<SinkError>,
    }

    impl TestSink {
        fn collecting() -> Arc<Self> {
            Arc::new(TestSink {
                sent: Mutex::new(Vec::new()),
                fail: None,
            })
        }

        fn failing(error: SinkError) -> Arc<Self> {
            Arc::new(TestSink {
                sent: Mutex::new(Vec::new()),
                fail: Some(error),
            })
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NotifySink for TestSink {
        fn notify(&self, notification: &Notification) -> std::result::Result<(), SinkError> {
            match &self.fail {
                Some(SinkError::Overflow) => Err(SinkError::Overflow),
                Some(SinkError::Closed) => Err(SinkError::Closed),
                None => {
                    self.sent.lock().unwrap().push(notification.clone());
                    Ok(())
                }
            }
        }
    }

    fn p2pkh_output(hash160_bytes: [u8; 20], value: u64) -> TxOut {
        let address = Address {
            payload: Payload::PubkeyHash(PubkeyHash::from_slice(&hash160_bytes).unwrap()),
            network: Network::Regtest,
        };
        TxOut {
            value,
            script_pubkey: address.script_pubkey(),
        }
    }

    fn block_with(outputs: Vec<TxOut>) -> (u32, BlockHash, Block) {
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: Default::default(),
                sequence: 0xffff_ffff,
                witness: vec![],
            }],
            output: outputs,
        };
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_blockhash: Default::default(),
            merkle_root: Default::default(),
            time: 0,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let block = Block {
            header,
            txdata: vec![tx],
        };
        (101, block.block_hash(), block)
    }

    fn notifier() -> Notifier {
        Notifier::new(1000, Duration::from_secs(600))
    }

    #[test]
    fn prefix_subscription_sees_matching_outputs_in_sequence() {
        let notifier = notifier();
        let sink = TestSink::collecting();
        let route = Route::new(1, sink.clone());

        let selector = Binary::new(8, vec![0x00]).unwrap();
        notifier
            .subscribe(route, SubscriptionKind::AddressPrefix, selector)
            .unwrap();

        let first = [0u8; 20];
        let mut second = [0u8; 20];
        second[1] = 0x77;
        let mut other = [0u8; 20];
        other[0] = 0xff;

        let (height, hash, block) = block_with(vec![
            p2pkh_output(first, 1000),
            p2pkh_output(second, 2000),
            p2pkh_output(other, 3000),
        ]);

        notifier.on_event(&ChainEvent::BlockConnected {
            height,
            hash,
            block: Arc::new(block),
        });

        let sent = sink.sent();
        assert_eq!(sent.len(), 2, "exactly the two matching outputs notify");
        assert_eq!(sent[0].sequence, 0);
        assert_eq!(sent[1].sequence, 1);
        for notification in &sent {
            assert_eq!(notification.code, 0);
            assert_eq!(notification.height, height);
            assert_eq!(notification.block_hash, hash);
            assert!(notification.tx.is_some());
        }
    }

    #[test]
    fn repeat_subscribe_renews_and_resets_sequence() {
        let notifier = notifier();
        let sink = TestSink::collecting();

        let selector = Binary::empty();
        let route = Route::new(1, sink.clone());
        notifier
            .subscribe(route.clone(), SubscriptionKind::Header, selector.clone())
            .unwrap();

        let (height, hash, block) = block_with(vec![p2pkh_output([0u8; 20], 1)]);
        notifier.on_event(&ChainEvent::BlockConnected {
            height,
            hash,
            block: Arc::new(block.clone()),
        });
        assert_eq!(sink.sent().last().unwrap().sequence, 0);

        // re-subscribe: still one entry, sequence restarts
        notifier
            .subscribe(route, SubscriptionKind::Header, selector)
            .unwrap();
        assert_eq!(notifier.subscription_count(), 1);

        notifier.on_event(&ChainEvent::BlockConnected {
            height,
            hash,
            block: Arc::new(block),
        });
        assert_eq!(sink.sent().last().unwrap().sequence, 0);
    }

    #[test]
    fn pool_limit_is_enforced() {
        let notifier = Notifier::new(2, Duration::from_secs(600));
        let sink = TestSink::collecting();
        let route = Route::new(1, sink);

        let sub = |n: u8| Binary::new(8, vec![n]).unwrap();
        notifier
            .subscribe(route.clone(), SubscriptionKind::AddressPrefix, sub(1))
            .unwrap();
        notifier
            .subscribe(route.clone(), SubscriptionKind::AddressPrefix, sub(2))
            .unwrap();
        assert_eq!(
            notifier.subscribe(route.clone(), SubscriptionKind::AddressPrefix, sub(3)),
            Err(GatewayError::PoolFilled)
        );

        // renewing an existing one is not an insert
        notifier
            .subscribe(route.clone(), SubscriptionKind::AddressPrefix, sub(2))
            .unwrap();

        // once one is gone there is room again
        notifier.unsubscribe(route.id, SubscriptionKind::AddressPrefix, sub(1));
        notifier
            .subscribe(route, SubscriptionKind::AddressPrefix, sub(3))
            .unwrap();
    }

    #[test]
    fn unsubscribe_sends_channel_stopped_once() {
        let notifier = notifier();
        let sink = TestSink::collecting();
        let route = Route::new(1, sink.clone());
        let selector = Binary::empty();

        notifier
            .subscribe(route.clone(), SubscriptionKind::Header, selector.clone())
            .unwrap();
        notifier.unsubscribe(route.id, SubscriptionKind::Header, selector.clone());
        notifier.unsubscribe(route.id, SubscriptionKind::Header, selector);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, GatewayError::ChannelStopped.code());
    }

    #[test]
    fn expired_subscriptions_purge_with_channel_timeout() {
        let notifier = Notifier::new(10, Duration::from_millis(0));
        let sink = TestSink::collecting();
        let route = Route::new(1, sink.clone());

        notifier
            .subscribe(route, SubscriptionKind::Header, Binary::empty())
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        notifier.purge();

        assert_eq!(notifier.subscription_count(), 0);
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, GatewayError::ChannelTimeout.code());
    }

    #[test]
    fn overflowing_route_loses_all_subscriptions_at_purge() {
        let notifier = notifier();
        let sink = TestSink::failing(SinkError::Overflow);
        let route = Route::new(1, sink);

        notifier
            .subscribe(route.clone(), SubscriptionKind::Header, Binary::empty())
            .unwrap();
        notifier
            .subscribe(
                route,
                SubscriptionKind::AddressPrefix,
                Binary::new(8, vec![0]).unwrap(),
            )
            .unwrap();

        let (height, hash, block) = block_with(vec![p2pkh_output([0u8; 20], 1)]);
        notifier.on_event(&ChainEvent::BlockConnected {
            height,
            hash,
            block: Arc::new(block),
        });

        notifier.purge();
        assert_eq!(notifier.subscription_count(), 0);
    }

    #[test]
    fn mempool_acceptance_notifies_with_zeroed_block() {
        let notifier = notifier();
        let sink = TestSink::collecting();
        let route = Route::new(1, sink.clone());

        notifier
            .subscribe(route, SubscriptionKind::TxAccepted, Binary::empty())
            .unwrap();

        let (_, _, block) = block_with(vec![p2pkh_output([3u8; 20], 5)]);
        let tx = Arc::new(block.txdata[0].clone());
        notifier.on_event(&ChainEvent::TxAccepted { tx });

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].height, 0);
        assert_eq!(sent[0].block_hash, Default::default());
    }
}

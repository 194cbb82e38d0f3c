use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bitcoin::Txid;
use bitcoincore_rpc::Client as RpcClient;

use crate::error::{fmt_error_chain, Result};
use crate::estimator::{Estimator, HORIZON_LARGE};
use crate::events::{ChainEvent, EventBus};
use crate::notifier::Notifier;
use crate::query::Query;
use crate::types::BlockId;
use crate::util::ShutdownToken;
use crate::Config;

#[cfg(feature = "electrum")]
use crate::electrum::ElectrumServer;
#[cfg(feature = "http")]
use crate::http::{BitcoindHttpServer, HttpOptions, NativeHttpServer};
#[cfg(feature = "stratum")]
use crate::stratum::{StratumServer, StratumV2Server};

const LT: &str = "bsg::app";

/// How many recent block ids are retained for reorg detection. Deeper
/// reorganizations fall back to a full re-baseline.
const REORG_DEPTH: usize = 100;

pub struct App {
    config: Config,
    query: Arc<Query>,
    estimator: Arc<Estimator>,
    bus: Arc<EventBus>,
    notifier: Arc<Notifier>,
    shutdown: ShutdownToken,

    // sync-loop state
    recent: VecDeque<BlockId>,
    mempool: HashSet<Txid>,
    suspended: bool,

    #[cfg(feature = "electrum")]
    electrum: Option<ElectrumServer>,
    #[cfg(feature = "stratum")]
    stratum: Option<StratumServer>,
    #[cfg(feature = "stratum")]
    stratum_v2: Option<StratumV2Server>,
    #[cfg(feature = "http")]
    native_http: Option<NativeHttpServer>,
    #[cfg(feature = "http")]
    bitcoind_http: Option<BitcoindHttpServer>,
}

impl App {
    pub fn boot(config: Config, shutdown: ShutdownToken) -> Result<Self> {
        debug!(target: LT, "{:?}", config);
        config.verify_tls_material()?;

        let rpc = Arc::new(RpcClient::new(
            config.bitcoind_url(),
            config.bitcoind_auth()?,
        )?);
        let query = Arc::new(Query::new(Arc::clone(&rpc), config.effective_network()));
        let estimator = Arc::new(Estimator::new());
        let bus = Arc::new(EventBus::new(config.queue_depth));
        let notifier = Arc::new(Notifier::new(
            config.subscription_limit,
            config.subscription_lease(),
        ));
        notifier.start(&shutdown);

        // the notification engine consumes chain events off the bus
        let bus_notifier = Arc::clone(&notifier);
        bus.subscribe("notifier", move |event| bus_notifier.on_event(&event));

        // rehydrate the estimator from the recent chain before serving
        let tip = query.get_tip()?;
        let backlog = HORIZON_LARGE.min(tip.height() as usize + 1);
        info!(
            target: LT,
            "initializing fee estimator from {} blocks (tip {})",
            backlog,
            tip.height()
        );
        if !estimator.initialize(shutdown.flag(), &query, backlog)? {
            warn!(target: LT, "fee estimation unavailable (initialization incomplete)");
        }

        #[cfg(feature = "electrum")]
        let electrum = if config.disable_electrum {
            None
        } else {
            Some(ElectrumServer::start(
                config.session_options(config.electrum_endpoint()),
                Arc::clone(&query),
                Arc::clone(&estimator),
                Arc::clone(&notifier),
                shutdown.clone(),
                config.donation_address.clone(),
            )?)
        };

        #[cfg(feature = "stratum")]
        let stratum = if config.disable_stratum {
            None
        } else {
            Some(StratumServer::start(
                config.session_options(config.stratum_endpoint),
                Arc::clone(&query),
                Arc::clone(&notifier),
                shutdown.clone(),
            )?)
        };

        #[cfg(feature = "stratum")]
        let stratum_v2 = match config.stratum_v2_endpoint {
            Some(endpoint) => Some(StratumV2Server::start(
                config.session_options(endpoint),
                shutdown.clone(),
            )?),
            None => None,
        };

        #[cfg(feature = "http")]
        let http_options = |addr| HttpOptions {
            addr,
            allowed_hosts: config.allowed_hosts.clone(),
            allowed_origins: config.allowed_origins.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            witness: !config.no_witness,
        };

        #[cfg(feature = "http")]
        let native_http = if config.disable_native {
            None
        } else {
            Some(NativeHttpServer::start(
                http_options(config.native_endpoint),
                Arc::clone(&query),
                Arc::clone(&notifier),
                shutdown.clone(),
            ))
        };

        #[cfg(feature = "http")]
        let bitcoind_http = if config.disable_bitcoind {
            None
        } else {
            Some(BitcoindHttpServer::start(
                http_options(config.bitcoind_endpoint),
                Arc::clone(&query),
                Arc::clone(&estimator),
                config.bitcoind_rest,
                shutdown.clone(),
            ))
        };

        let mut recent = VecDeque::with_capacity(REORG_DEPTH);
        recent.push_back(tip);
        query.index_block(tip.height(), &query.get_block(&tip.hash())?);

        let mempool = query.get_mempool_txids()?.into_iter().collect();

        Ok(App {
            config,
            query,
            estimator,
            bus,
            notifier,
            shutdown,
            recent,
            mempool,
            suspended: false,
            #[cfg(feature = "electrum")]
            electrum,
            #[cfg(feature = "stratum")]
            stratum,
            #[cfg(feature = "stratum")]
            stratum_v2,
            #[cfg(feature = "http")]
            native_http,
            #[cfg(feature = "http")]
            bitcoind_http,
        })
    }

    /// Poll the chain and mempool, turning deltas into bus events, until
    /// shutdown. Blocks the calling thread.
    pub fn run(mut self) {
        let interval = self.config.poll_interval();
        loop {
            if self.shutdown.is_signaled() {
                break;
            }
            match self.sync() {
                Ok(()) => {
                    if self.suspended {
                        self.suspended = false;
                        info!(target: LT, "chain backend recovered");
                        self.bus.publish(ChainEvent::Resume);
                    }
                }
                Err(e) => {
                    warn!(target: LT, "sync failed: {}", fmt_error_chain(&e));
                    if !self.suspended {
                        self.suspended = true;
                        self.bus.publish(ChainEvent::Suspend);
                    }
                }
            }
            if self.shutdown.wait_timeout(interval) {
                break;
            }
        }
        self.stop();
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_blocks()?;
        self.sync_mempool()?;
        Ok(())
    }

    fn sync_blocks(&mut self) -> Result<()> {
        let tip = self.query.get_tip()?;
        let last = *self.recent.back().expect("baseline is never empty");
        if tip == last {
            return Ok(());
        }

        // back out stale blocks (reorg)
        while let Some(stored) = self.recent.back().copied() {
            let on_chain = stored.height() <= tip.height()
                && self.query.get_block_hash(stored.height())? == stored.hash();
            if on_chain {
                break;
            }
            warn!(
                target: LT,
                "reorg: backing out block {} {}",
                stored.height(),
                stored.hash()
            );
            let block = Arc::new(self.query.get_block(&stored.hash())?);
            let rates = self.query.get_block_fees(&stored.hash())?;
            self.estimator.pop_rates(&rates, 0);
            self.query.unindex_block(stored.height(), &block);
            self.bus.publish(ChainEvent::BlockDisconnected {
                height: stored.height(),
                hash: stored.hash(),
                block,
            });
            self.recent.pop_back();
            if self.recent.is_empty() {
                warn!(target: LT, "reorg beyond retained depth, re-baselining");
                self.recent.push_back(BlockId(tip.height(), tip.hash()));
                self.query
                    .index_block(tip.height(), &self.query.get_block(&tip.hash())?);
                self.bus.publish(ChainEvent::TipChanged {
                    height: tip.height(),
                    hash: tip.hash(),
                });
                return Ok(());
            }
        }

        // connect forward to the new tip
        let mut height = self.recent.back().expect("nonempty").height();
        while height < tip.height() {
            height += 1;
            let hash = self.query.get_block_hash(height)?;
            let block = Arc::new(self.query.get_block(&hash)?);
            let rates = self.query.get_block_fees(&hash)?;

            self.estimator.push_rates(&rates, 0);
            self.query.index_block(height, &block);

            // confirmed txs leave the mempool snapshot
            for tx in &block.txdata {
                self.mempool.remove(&tx.txid());
            }

            debug!(target: LT, "connected block {} {}", height, hash);
            self.bus.publish(ChainEvent::BlockConnected {
                height,
                hash,
                block,
            });

            self.recent.push_back(BlockId(height, hash));
            while self.recent.len() > REORG_DEPTH {
                self.recent.pop_front();
            }
        }

        self.bus.publish(ChainEvent::TipChanged {
            height: tip.height(),
            hash: tip.hash(),
        });
        Ok(())
    }

    fn sync_mempool(&mut self) -> Result<()> {
        let current: HashSet<Txid> = self.query.get_mempool_txids()?.into_iter().collect();

        for txid in current.difference(&self.mempool) {
            // the tx may already be gone again by the time we fetch it
            let tx = match self.query.get_transaction(txid) {
                Ok(tx) => Arc::new(tx),
                Err(_) => continue,
            };
            self.query.index_mempool_tx(&tx);
            trace!(target: LT, "mempool accepted {}", txid);
            self.bus.publish(ChainEvent::TxAccepted { tx });
        }

        self.mempool = current;
        Ok(())
    }

    fn stop(self) {
        info!(target: LT, "shutting down");
        // Stop is propagated first; subscribers finish their current
        // dispatch and unwind
        self.bus.publish(ChainEvent::Stop);
        self.notifier.stop();

        #[cfg(feature = "electrum")]
        if let Some(electrum) = &self.electrum {
            electrum.stop();
        }
        #[cfg(feature = "stratum")]
        {
            if let Some(stratum) = &self.stratum {
                stratum.stop();
            }
            if let Some(stratum_v2) = &self.stratum_v2 {
                stratum_v2.stop();
            }
        }
        // the http servers watch the shutdown token themselves and unwind
        // on their own threads

        info!(target: LT, "bye");
    }
}

#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitcoin_hashes;

pub mod util;

pub mod app;
pub mod bitcoind;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod estimator;
pub mod events;
pub mod native;
pub mod notifier;
pub mod query;
pub mod rpc;
pub mod session;
pub mod types;

pub use app::App;
pub use config::Config;
pub use error::{Error, GatewayError, Result};
pub use estimator::Estimator;
pub use events::{ChainEvent, EventBus};
pub use notifier::Notifier;
pub use query::Query;

#[cfg(feature = "electrum")]
pub mod electrum;
#[cfg(feature = "electrum")]
pub use electrum::ElectrumServer;

#[cfg(feature = "stratum")]
pub mod stratum;
#[cfg(feature = "stratum")]
pub use stratum::{StratumServer, StratumV2Server};

#[cfg(feature = "http")]
pub mod http;

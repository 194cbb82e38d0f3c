use std::time::Duration;
use std::{net, path};

use structopt::StructOpt;

use bitcoin::Network;
use bitcoincore_rpc::Auth as RpcAuth;

use crate::error::{OptionExt, Result};
use crate::session::SessionOptions;

#[derive(StructOpt, Debug, Clone)]
pub struct Config {
    #[structopt(
        short = "n",
        long,
        help = "One of 'bitcoin', 'testnet' or 'regtest'",
        default_value = "bitcoin",
        env = "BS_NETWORK",
        hide_env_values(true),
        display_order(1)
    )]
    pub network: Network,

    #[structopt(
        long,
        help = "Shortcut for --network bitcoin",
        conflicts_with = "testnet",
        display_order(2)
    )]
    pub mainnet: bool,

    #[structopt(long, help = "Shortcut for --network testnet", display_order(3))]
    pub testnet: bool,

    // cannot be set using an env var, it does not play nicely with from_occurrences
    #[structopt(
        short = "v",
        long,
        help = "Increase verbosity level (up to 4 times)",
        parse(from_occurrences),
        display_order(98)
    )]
    pub verbose: usize,

    #[structopt(
        short = "t",
        long,
        help = "Show timestamps in log messages",
        display_order(99)
    )]
    pub timestamp: bool,

    #[structopt(
        long,
        help = "Print the effective settings and exit",
        display_order(96)
    )]
    pub settings: bool,

    #[structopt(
        long,
        help = "Initialize the data directory and exit (refuses a non-empty one)",
        display_order(95)
    )]
    pub initchain: bool,

    #[structopt(
        long,
        help = "Path to the data directory [default: ~/.bsg]",
        env = "BS_DATA_DIR",
        hide_env_values(true),
        display_order(10)
    )]
    pub data_dir: Option<path::PathBuf>,

    #[structopt(
        short = "c",
        long = "config",
        help = "Load settings from an env-style config file",
        env = "BS_CONFIG",
        hide_env_values(true),
        display_order(11)
    )]
    pub config_file: Option<path::PathBuf>,

    /// Positional alternative to --config.
    #[structopt(name = "CONFIG", parse(from_os_str))]
    pub config_positional: Option<path::PathBuf>,

    // bitcoind backend
    #[structopt(
        short = "u",
        long,
        help = "URL for the bitcoind RPC server [default: http://localhost:<network-rpc-port>]",
        env = "BS_BITCOIND_URL",
        hide_env_values(true),
        display_order(30)
    )]
    pub bitcoind_url: Option<String>,

    #[structopt(
        short = "d",
        long,
        help = "Path to bitcoind directory (used for the cookie file) [default: ~/.bitcoin]",
        env = "BS_BITCOIND_DIR",
        hide_env_values(true),
        display_order(31)
    )]
    pub bitcoind_dir: Option<path::PathBuf>,

    #[structopt(
        short = "w",
        long,
        help = "Specify the bitcoind wallet to use (optional)",
        env = "BS_BITCOIND_WALLET",
        hide_env_values(true),
        display_order(32)
    )]
    pub bitcoind_wallet: Option<String>,

    #[structopt(
        short = "C",
        long,
        help = "Credentials for the bitcoind RPC server (as <username>:<password>, instead of the cookie file)",
        env = "BS_BITCOIND_CRED",
        hide_env_values(true),
        display_order(33)
    )]
    pub bitcoind_cred: Option<String>,

    #[structopt(
        long,
        help = "Cookie file for the bitcoind RPC server [default: <bitcoind-dir>/.cookie]",
        env = "BS_BITCOIND_COOKIE",
        hide_env_values(true),
        display_order(34)
    )]
    pub bitcoind_cookie: Option<path::PathBuf>,

    // endpoints
    #[structopt(
        short = "e",
        long,
        help = "Address to bind the electrum server [default: '127.0.0.1:50001' for mainnet, '127.0.0.1:60001' for testnet or '127.0.0.1:60401' for regtest]",
        env = "BS_ELECTRUM_ENDPOINT",
        hide_env_values(true),
        display_order(40)
    )]
    pub electrum_endpoint: Option<net::SocketAddr>,

    #[structopt(long, help = "Disable the electrum endpoint", display_order(41))]
    pub disable_electrum: bool,

    #[structopt(
        long,
        help = "Address to bind the native REST/WebSocket api server",
        default_value = "127.0.0.1:3080",
        env = "BS_NATIVE_ENDPOINT",
        hide_env_values(true),
        display_order(42)
    )]
    pub native_endpoint: net::SocketAddr,

    #[structopt(long, help = "Disable the native api endpoint", display_order(43))]
    pub disable_native: bool,

    #[structopt(
        long,
        help = "Address to bind the bitcoind-compatible JSON-RPC server",
        default_value = "127.0.0.1:3081",
        env = "BS_BITCOIND_ENDPOINT",
        hide_env_values(true),
        display_order(44)
    )]
    pub bitcoind_endpoint: net::SocketAddr,

    #[structopt(long, help = "Disable the bitcoind-compatible endpoint", display_order(45))]
    pub disable_bitcoind: bool,

    #[structopt(
        long,
        help = "Serve the bitcoind-style REST subset under the JSON-RPC port",
        env = "BS_BITCOIND_REST",
        hide_env_values(true),
        display_order(46)
    )]
    pub bitcoind_rest: bool,

    #[structopt(
        long,
        help = "Address to bind the stratum v1 server",
        default_value = "127.0.0.1:3333",
        env = "BS_STRATUM_ENDPOINT",
        hide_env_values(true),
        display_order(47)
    )]
    pub stratum_endpoint: net::SocketAddr,

    #[structopt(long, help = "Disable the stratum v1 endpoint", display_order(48))]
    pub disable_stratum: bool,

    #[structopt(
        long,
        help = "Enable the stratum v2 listener and bind it to this address",
        env = "BS_STRATUM_V2_ENDPOINT",
        hide_env_values(true),
        display_order(49)
    )]
    pub stratum_v2_endpoint: Option<net::SocketAddr>,

    // admission
    #[structopt(
        long,
        help = "Host header allow-list for the http endpoints (exact match, any when empty)",
        env = "BS_ALLOWED_HOSTS",
        hide_env_values(true),
        use_delimiter(true),
        display_order(60)
    )]
    pub allowed_hosts: Vec<String>,

    #[structopt(
        long,
        help = "Origin header allow-list for the http endpoints (enforced only when an Origin is sent)",
        env = "BS_ALLOWED_ORIGINS",
        hide_env_values(true),
        use_delimiter(true),
        display_order(61)
    )]
    pub allowed_origins: Vec<String>,

    #[structopt(
        long,
        help = "Maximum inbound connections per endpoint",
        default_value = "512",
        env = "BS_CONNECTION_LIMIT",
        hide_env_values(true),
        display_order(62)
    )]
    pub connection_limit: usize,

    // subscriptions
    #[structopt(
        long,
        help = "Maximum number of notification subscriptions",
        default_value = "100000000",
        env = "BS_SUBSCRIPTION_LIMIT",
        hide_env_values(true),
        display_order(70)
    )]
    pub subscription_limit: usize,

    #[structopt(
        long,
        help = "Subscription lease time in minutes (purged at a tenth of this)",
        default_value = "10",
        env = "BS_SUBSCRIPTION_EXPIRATION_MINUTES",
        hide_env_values(true),
        display_order(71)
    )]
    pub subscription_expiration_minutes: u64,

    #[structopt(
        long,
        help = "Outbound frames queued per channel before it is dropped",
        default_value = "64",
        env = "BS_QUEUE_DEPTH",
        hide_env_values(true),
        display_order(72)
    )]
    pub queue_depth: usize,

    #[structopt(
        long,
        help = "Interval for the WebSocket tip heartbeat (in seconds)",
        default_value = "4",
        env = "BS_HEARTBEAT_SERVICE_SECONDS",
        hide_env_values(true),
        display_order(73)
    )]
    pub heartbeat_service_seconds: u64,

    #[structopt(
        short = "i",
        long,
        help = "Interval for polling the chain and mempool (in milliseconds)",
        default_value = "1000",
        env = "BS_POLLING_INTERVAL_MILLISECONDS",
        hide_env_values(true),
        display_order(74)
    )]
    pub polling_interval_ms: u64,

    #[structopt(
        long,
        help = "Strip witness data from notification payloads",
        env = "BS_NO_WITNESS",
        hide_env_values(true),
        display_order(75)
    )]
    pub no_witness: bool,

    #[structopt(
        long,
        help = "Donation address reported to electrum clients",
        env = "BS_DONATION_ADDRESS",
        hide_env_values(true),
        display_order(76)
    )]
    pub donation_address: Option<String>,

    // TLS material is only validated here; termination is expected to be
    // handled by a fronting proxy.
    #[structopt(
        long,
        help = "Path to the TLS certificate handed to the fronting proxy",
        env = "BS_TLS_CERT",
        hide_env_values(true),
        display_order(80)
    )]
    pub tls_cert: Option<path::PathBuf>,

    #[structopt(
        long,
        help = "Path to the TLS private key handed to the fronting proxy",
        env = "BS_TLS_KEY",
        hide_env_values(true),
        display_order(81)
    )]
    pub tls_key: Option<path::PathBuf>,

    #[structopt(
        long,
        help = "Path to the TLS client CA bundle handed to the fronting proxy",
        env = "BS_TLS_CA",
        hide_env_values(true),
        display_order(82)
    )]
    pub tls_ca: Option<path::PathBuf>,
}

impl Config {
    /// Load the env-style config file (if any) before clap evaluates `env`
    /// attributes, so file values act as defaults below real env vars.
    pub fn dotenv() {
        let args: Vec<String> = std::env::args().collect();
        let explicit = args
            .iter()
            .position(|arg| arg == "-c" || arg == "--config")
            .and_then(|i| args.get(i + 1))
            .map(path::PathBuf::from)
            .or_else(|| std::env::var_os("BS_CONFIG").map(path::PathBuf::from))
            .or_else(|| {
                args.last()
                    .filter(|arg| arg.ends_with(".env") || arg.ends_with(".cfg"))
                    .map(path::PathBuf::from)
            });
        match explicit {
            Some(path) => {
                dotenv::from_path(&path).ok();
            }
            None => {
                dirs::home_dir().map(|home| dotenv::from_path(home.join("bsg.env")).ok());
            }
        }
    }

    /// `--mainnet`/`--testnet` shortcuts override `--network`.
    pub fn effective_network(&self) -> Network {
        if self.testnet {
            Network::Testnet
        } else if self.mainnet {
            Network::Bitcoin
        } else {
            self.network
        }
    }

    pub fn data_dir(&self) -> path::PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".bsg"))
                .unwrap_or_else(|| ".bsg".into())
        })
    }

    pub fn bitcoind_url(&self) -> String {
        format!(
            "{}/{}",
            self.bitcoind_url.as_ref().map_or_else(
                || {
                    format!(
                        "http://localhost:{}",
                        match self.effective_network() {
                            Network::Bitcoin => 8332,
                            Network::Testnet => 18332,
                            Network::Regtest => 18443,
                        }
                    )
                },
                |url| url.trim_end_matches('/').into()
            ),
            match self.bitcoind_wallet {
                Some(ref wallet) => format!("wallet/{}", wallet),
                None => "".into(),
            }
        )
    }

    pub fn bitcoind_auth(&self) -> Result<RpcAuth> {
        Ok(self
            .bitcoind_cred
            .as_ref()
            .and_then(|cred| {
                let mut parts = cred.splitn(2, ':');
                Some(RpcAuth::UserPass(parts.next()?.into(), parts.next()?.into()))
            })
            .or_else(|| {
                let cookie = self.bitcoind_cookie.clone().or_else(|| self.default_cookie())?;
                Some(RpcAuth::CookieFile(cookie))
            })
            .or_err("no available authentication for bitcoind rpc, please specify credentials or a cookie file")?)
    }

    fn default_cookie(&self) -> Option<path::PathBuf> {
        let mut dir = self
            .bitcoind_dir
            .clone()
            .or_else(|| Some(dirs::home_dir()?.join(".bitcoin")))?;
        match self.effective_network() {
            Network::Bitcoin => (),
            Network::Testnet => dir.push("testnet3"),
            Network::Regtest => dir.push("regtest"),
        }
        let cookie = dir.join(".cookie");
        if cookie.exists() {
            Some(cookie)
        } else {
            None
        }
    }

    pub fn electrum_endpoint(&self) -> net::SocketAddr {
        self.electrum_endpoint.unwrap_or_else(|| {
            net::SocketAddr::new(
                "127.0.0.1".parse().unwrap(),
                match self.effective_network() {
                    Network::Bitcoin => 50001,
                    Network::Testnet => 60001,
                    Network::Regtest => 60401,
                },
            )
        })
    }

    pub fn session_options(&self, endpoint: net::SocketAddr) -> SessionOptions {
        SessionOptions {
            endpoint,
            connection_limit: self.connection_limit,
            queue_depth: self.queue_depth,
        }
    }

    pub fn subscription_lease(&self) -> Duration {
        Duration::from_secs(self.subscription_expiration_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_service_seconds)
    }

    /// TLS material, when configured, must at least exist on disk.
    pub fn verify_tls_material(&self) -> Result<()> {
        for path in [&self.tls_cert, &self.tls_key, &self.tls_ca].iter().copied().flatten() {
            ensure!(path.exists(), "TLS file {:?} not found", path);
        }
        Ok(())
    }

    pub fn setup_logger(&self) {
        use log::Level;
        if self.timestamp {
            pretty_env_logger::formatted_timed_builder()
        } else {
            pretty_env_logger::formatted_builder()
        }
        .filter_module(
            "bsg",
            match self.verbose {
                0 => Level::Info,
                1 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_module(
            "bitcoincore_rpc",
            match self.verbose {
                0 | 1 => Level::Warn,
                2 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_module(
            "warp",
            match self.verbose {
                0 | 1 => Level::Warn,
                2 => Level::Info,
                3 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_module("hyper", Level::Warn.to_level_filter())
        .filter_level(
            match self.verbose {
                0 | 1 => Level::Warn,
                2 | 3 => Level::Info,
                4 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .init();
    }
}

#[macro_use]
extern crate log;

use std::fs;
use std::process::exit;

use anyhow::ensure;
use structopt::StructOpt;

use bsg::error::{fmt_error_chain, Result};
use bsg::util::ShutdownToken;
use bsg::{App, Config};

// Exit codes: 0 success, 1 invalid parameter, 2 not started, 3 runtime
// failure.
const EXIT_OK: i32 = 0;
const EXIT_INVALID_PARAMETER: i32 = 1;
const EXIT_NOT_STARTED: i32 = 2;
const EXIT_RUNTIME_FAILURE: i32 = 3;

fn main() {
    Config::dotenv();
    let config = Config::from_args(); // clap exits 1 by itself on bad args

    if config.settings {
        println!("{:#?}", config);
        exit(EXIT_OK);
    }

    if config.initchain {
        match init_chain(&config) {
            Ok(()) => exit(EXIT_OK),
            Err(e) => {
                eprintln!("initchain failed: {}", fmt_error_chain(&e));
                exit(EXIT_INVALID_PARAMETER);
            }
        }
    }

    config.setup_logger();

    let shutdown = ShutdownToken::new();
    setup_signals(&shutdown);

    let app = match App::boot(config, shutdown.clone()) {
        Ok(app) => app,
        Err(e) => {
            error!("server failed to start: {}", fmt_error_chain(&e));
            exit(EXIT_NOT_STARTED);
        }
    };

    info!("server started");
    app.run();

    if shutdown.is_signaled() {
        exit(EXIT_OK);
    }
    // the run loop only returns unsignaled when something went wrong
    exit(EXIT_RUNTIME_FAILURE);
}

/// Create the data directory for the configured network, refusing to touch
/// one that already has content.
fn init_chain(config: &Config) -> Result<()> {
    use bitcoin::blockdata::constants::genesis_block;

    let dir = config.data_dir();
    if dir.exists() {
        let occupied = fs::read_dir(&dir)?.next().is_some();
        ensure!(!occupied, "directory {:?} exists and is not empty", dir);
    } else {
        fs::create_dir_all(&dir)?;
    }

    let network = config.effective_network();
    let name = network_name(network);
    let genesis = genesis_block(network).block_hash();
    fs::write(dir.join("CHAIN"), format!("{}\n{}\n", name, genesis))?;

    println!("initialized {:?} for {} (genesis {})", dir, name, genesis);
    Ok(())
}

fn network_name(network: bitcoin::Network) -> &'static str {
    match network {
        bitcoin::Network::Bitcoin => "bitcoin",
        bitcoin::Network::Testnet => "testnet",
        bitcoin::Network::Regtest => "regtest",
    }
}

#[cfg(unix)]
fn setup_signals(shutdown: &ShutdownToken) {
    use signal_hook::iterator::Signals;
    use signal_hook::{SIGINT, SIGTERM};

    let signals = Signals::new(&[SIGINT, SIGTERM]).expect("signal registration failed");
    let shutdown = shutdown.clone();
    bsg::util::spawn_thread("signals", move || {
        for signal in signals.forever() {
            info!("received signal {}, shutting down", signal);
            shutdown.signal();
            break;
        }
    });
}

#[cfg(not(unix))]
fn setup_signals(_shutdown: &ShutdownToken) {
    // no signal integration off unix; the process stops with the terminal
}

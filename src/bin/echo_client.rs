//! Interactive client for `foldersock-echo-server`.
//!
//! Connects to the given server id, sends every stdin line and prints
//! the replies. Ctrl-C closes the endpoint.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use foldersock::{Config, Endpoint, Tracker};

/// How long to wait for the server's OK before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "foldersock-echo-client")]
#[command(version)]
#[command(about = "Send lines to an echo server over a shared folder")]
struct Cli {
    /// Id printed by the server
    server_id: String,

    /// Shared root (defaults to $FOLDERSOCK_ROOT or ~/Dropbox/socks)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Detect changes by polling instead of native events
    #[arg(long)]
    poll: bool,
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();
    if let Some(root) = cli.root {
        config.root = root;
    }
    if cli.poll {
        config.watch_mode = foldersock::WatchMode::Poll;
    }

    let tracker = Tracker::start(config)?;
    let (connected_tx, connected_rx) = mpsc::channel();
    let client = Endpoint::open(&tracker, cli.server_id.as_str(), move |endpoint, peer| {
        endpoint.on_receive(|_from, text| {
            println!("\r{text}");
            prompt();
        });
        let _ = connected_tx.send(peer.to_string());
    })?;

    let closer = client.clone();
    ctrlc::set_handler(move || {
        closer.close();
        std::process::exit(0);
    })
    .context("Failed to install Ctrl-C handler")?;

    let peer = match connected_rx.recv_timeout(CONNECT_TIMEOUT) {
        Ok(peer) => peer,
        Err(_timeout) => {
            client.close();
            anyhow::bail!("No answer from {} within {:?}", cli.server_id, CONNECT_TIMEOUT);
        }
    };
    println!("connected to {peer}");

    prompt();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if let Err(e) = client.send(&line) {
            client.close();
            return Err(e.into());
        }
    }

    client.close();
    Ok(())
}

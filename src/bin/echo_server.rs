//! Echo server over a shared folder.
//!
//! Prints its endpoint id, then answers every message with
//! `"<text> from a server<id>"` until Enter is pressed.

use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use foldersock::{Config, Endpoint, Tracker};

#[derive(Parser)]
#[command(name = "foldersock-echo-server")]
#[command(version)]
#[command(about = "Echo every message received over a shared folder")]
struct Cli {
    /// Shared root (defaults to $FOLDERSOCK_ROOT or ~/Dropbox/socks)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Fixed endpoint id instead of a generated one
    #[arg(long)]
    id: Option<String>,

    /// Detect changes by polling instead of native events
    #[arg(long)]
    poll: bool,
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
    let mut builder = Endpoint::builder();
    if let Some(id) = cli.id {
        builder = builder.id(id);
    }
    let server = builder.build(&tracker)?;
    println!("{}", server.id());

    let replier = server.downgrade();
    server.on_receive(move |from, text| {
        log::info!("{from}: {text}");
        let Some(replier) = replier.upgrade() else {
            return;
        };
        let reply = format!("{text} from a server<{}>", replier.id());
        if let Err(e) = replier.send(&reply) {
            log::error!("Reply to {from} failed: {e}");
        }
    });

    let closer = server.clone();
    ctrlc::set_handler(move || {
        closer.close();
        std::process::exit(0);
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    server.close();
    Ok(())
}

//! Foldersock - socket-like channels over a file-synchronized folder.
//!
//! Processes on different machines that share a replicated directory (a
//! Dropbox folder, a network mount) talk to each other by appending
//! newline-delimited JSON frames to files inside it. Nothing but the
//! sync client carries the bytes.
//!
//! # Architecture
//!
//! - **Tracker** - Watches paths, turns growth into per-channel deltas
//! - **Endpoint** - Socket-like handle: handshake, send, receive, close
//! - **Frame** - Wire format of one message (`{"time":..,"data":..}\n`)
//!
//! ```no_run
//! use foldersock::{Config, Endpoint, Tracker};
//!
//! # fn main() -> anyhow::Result<()> {
//! let tracker = Tracker::start(Config::load())?;
//! let client = Endpoint::open(&tracker, "server_4242_0", |endpoint, peer| {
//!     println!("connected to {peer}");
//!     endpoint.on_receive(|from, text| println!("{from}: {text}"));
//! })?;
//! client.send("hello")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`tracker`] - Change tracking and delta extraction
//! - [`endpoint`] - Channel endpoints and the HELLO/OK/BYE handshake
//! - [`frame`] - Frame encoding and line reassembly
//! - [`file_watcher`] - Native and polling watch backends
//! - [`config`] - Configuration loading

pub mod config;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod file_watcher;
pub mod frame;
pub mod layout;
pub mod protocol;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, SettleConfig, WatchMode};
pub use endpoint::{Endpoint, EndpointBuilder, IntoPeers, WeakEndpoint};
pub use error::SocketError;
pub use frame::Frame;
pub use protocol::LegState;
pub use tracker::{Notification, Subscriber, Tracker};

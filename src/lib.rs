//! Treesync shares a directory over TCP and mirrors it elsewhere, live.
//!
//! A server exposes one directory. Clients either inspect its structure or
//! sync it: the server streams a snapshot of every file, then fans out
//! filesystem changes as they happen so each mirror stays identical to the
//! shared tree.
//!
//! The wire format is a small packet protocol layered on one TCP stream:
//! length-prefixed packets with reorder-tolerant ids, JSON messages,
//! fragmentation for long messages, and multiplexed binary streams for
//! file content. See [`protocol`] for the frame shapes and [`connection`]
//! for the transport.

pub mod cli;
pub mod client;
pub mod connection;
pub mod framing;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod url;
pub mod watch;

pub use client::Client;
pub use server::{Server, ShareOptions};

/// Connect to a sharing server at `tcp://host:port`.
pub async fn connect(url: &str) -> anyhow::Result<Client> {
    Client::connect(url).await
}

/// Bind a server sharing a local directory. Call [`Server::run`] to serve.
pub async fn share(options: ShareOptions) -> anyhow::Result<Server> {
    Server::bind(options).await
}

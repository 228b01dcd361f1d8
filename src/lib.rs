//! TLS 1.3 tunneling proxy.
//!
//! The crate runs in one of two roles selected from the [`ListenConfig`]:
//!
//! - **proxy** (server): terminates TLS 1.3, authenticates the peer with a
//!   shared secret line, then speaks SOCKS5 (and optionally HTTP/HTTPS
//!   proxy) to the authenticated client, relaying traffic to the requested
//!   origin.
//! - **forward** (client): accepts plaintext local connections, dials the
//!   server over TLS 1.3 verified by public-key pinning instead of CA
//!   trust, authenticates, and splices bytes between the two sockets.
//!
//! ```no_run
//! use tlstun::{start_server, CancellationToken, ListenConfig};
//!
//! # async fn run() -> Result<(), tlstun::Error> {
//! let mut config = ListenConfig::new();
//! config.listen_port = "1080".into();
//! config.server_cert_file = "server.crt".into();
//! config.server_key_file = "server.key".into();
//!
//! let shutdown = CancellationToken::new();
//! start_server(shutdown, config, false).await
//! # }
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod logsink;

mod buffer_pool;
mod connection;
mod forward;
mod http;
mod peek;
mod proxy;
mod relay;
mod secret;
mod socks;
mod tls;

#[cfg(test)]
mod tests;

pub use config::{ListenConfig, Role};
pub use logsink::{set_log_sink, LogSink};

use logsink::EventLog;

/// Dial and TLS handshake deadline, both roles.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Client-side wait for the one-byte auth reply.
pub(crate) const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-direction relay deadline, refreshed on every read and write.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Single byte written by the server after a matching secret line.
pub(crate) const REPLY_SUCCESS: u8 = 0x09;
/// Upper bound on the secret line read before authentication.
pub(crate) const MAX_SECRET_LINE: usize = 1024;

/// Errors surfaced out of [`start_server`].
///
/// Only startup problems are fatal; per-connection network and protocol
/// failures are logged and end that connection alone.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither `server_address` nor `server_cert_file` is set.
    #[error("miss config")]
    MissConfig,

    /// Bad certificate, key, or pinned public key material.
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// Run the role selected by `config` until `shutdown` fires.
///
/// Role selection, first match wins: a non-empty `server_address` starts the
/// forward (client) role toward that address; otherwise a non-empty
/// `server_cert_file` starts the proxy (server) role; otherwise the call
/// fails with [`Error::MissConfig`].
///
/// `quiet` suppresses per-connection log lines; startup and error lines are
/// always emitted.
pub async fn start_server(
    shutdown: CancellationToken,
    config: ListenConfig,
    quiet: bool,
) -> Result<(), Error> {
    let events = Arc::new(EventLog::new(quiet));
    match config.role()? {
        Role::Forward => forward::run(Arc::new(config), events, shutdown).await,
        Role::Proxy => proxy::run(Arc::new(config), events, shutdown).await,
    }
}

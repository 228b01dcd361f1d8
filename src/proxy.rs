use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::ListenConfig;
use crate::connection::{self, ConnectionGuard};
use crate::logsink::EventLog;
use crate::peek::PeekedStream;
use crate::{http, relay, secret, socks, tls, Error, CONNECT_TIMEOUT};

/// How long shutdown waits for in-flight connections after the accept loop
/// exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy (server) role: terminate TLS 1.3, authenticate, dispatch SOCKS5 or
/// HTTP, relay to the origin.
///
/// Startup exports the leaf SPKI to the configured public-key file so
/// operators can distribute the pin. The accept loop runs until the
/// cancellation token fires; accept errors are logged and skipped.
pub(crate) async fn run(
    config: Arc<ListenConfig>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let (server_config, spki) =
        tls::build_server_config(&config.server_cert_file, &config.server_key_file)?;
    tls::export_public_key(&spki, &config.public_key_file)?;
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind(config.listen_addr()).await?;
    if config.with_http {
        events.report(format!(
            "[*] http & socks5 listen on: [{}]",
            config.listen_port
        ));
    } else {
        events.report(format!("[*] socks5 listen on: [{}]", config.listen_port));
    }

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                events.detail("[*] proxy stopped");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        events.report(format!("[x] accept error [{e}]"));
                        continue;
                    }
                };
                events.detail(format!("[+] new client [{peer}] connected"));

                let acceptor = acceptor.clone();
                let config = config.clone();
                let events = events.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _guard = ConnectionGuard::new();
                    tokio::select! {
                        biased;
                        () = conn_shutdown.cancelled() => {}
                        () = handle_client(
                            stream,
                            peer,
                            acceptor,
                            config,
                            events,
                            conn_shutdown.clone(),
                        ) => {}
                    }
                });
            }
        }
    }

    if !connection::wait_for_drain(DRAIN_TIMEOUT).await {
        events.report(format!(
            "[x] shutdown with {} connections still active",
            ConnectionGuard::active_count()
        ));
    }
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    config: Arc<ListenConfig>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) {
    let tls_stream = match timeout(CONNECT_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.detail(format!("[x] failed to handshake with [{peer}]: [{e}]"));
            return;
        }
        Err(_) => {
            events.detail(format!("[x] handshake with [{peer}] timed out"));
            return;
        }
    };

    let mut conn = BufReader::new(tls_stream);
    if let Err(e) = secret::authenticate_server(&mut conn, &config.secret).await {
        events.detail(format!("[x] authentication failed for [{peer}]: [{e}]"));
        return;
    }

    // One byte of the next payload decides the protocol; it stays buffered
    // for the downstream parser.
    let first = match conn.fill_buf().await {
        Ok([first, ..]) => *first,
        _ => return,
    };

    if first == socks::v5::VERSION {
        let address = match socks::read_request(&mut conn).await {
            Ok(address) => address,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    events.report(format!("[x] parse request error [{e}]"));
                    let _ = conn.get_mut().write_all(e.to_string().as_bytes()).await;
                }
                return;
            }
        };
        handle_socks5(conn, address, peer, events, shutdown).await;
    } else if config.with_http {
        http::serve(PeekedStream::new(conn), events, shutdown).await;
    } else {
        events.report("[x] parse request error [unsupported protocol]");
        let _ = conn.get_mut().write_all(b"unsupported protocol").await;
    }
}

async fn handle_socks5<S>(
    mut conn: BufReader<S>,
    address: String,
    peer: SocketAddr,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let origin = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.detail(format!("[x] connect [{address}] error [{e}]"));
            let _ = conn.get_mut().write_all(e.to_string().as_bytes()).await;
            return;
        }
        Err(_) => {
            events.detail(format!("[x] connect [{address}] timed out"));
            let _ = conn.get_mut().write_all(b"connect timed out").await;
            return;
        }
    };
    events.detail(format!("[+] connect to [{address}] success"));

    if socks::write_success(conn.get_mut()).await.is_err() {
        return;
    }

    let (up, down) = relay::splice(PeekedStream::new(conn), origin, &shutdown).await;
    events.detail(format!(
        "[-] client [{peer}] disconnected: {up}/{down} bytes"
    ));
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::ListenConfig;
use crate::connection::{self, ConnectionGuard};
use crate::logsink::EventLog;
use crate::{relay, secret, tls, Error, CONNECT_TIMEOUT};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Forward (client) role: accept plaintext local connections and splice
/// each one with a freshly dialed, pinned TLS 1.3 connection to the server.
///
/// The pin is loaded and validated before the listener binds; an
/// unparseable pin refuses startup.
pub(crate) async fn run(
    config: Arc<ListenConfig>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let pin = tls::load_pinned_key(&config.public_key_file)?;
    let client_config = tls::build_client_config(pin)?;
    let connector = TlsConnector::from(client_config);
    let server_name = server_name(&config.server_address)?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    events.report(format!(
        "[*] listen on: [{}] server on: [{}]",
        config.listen_port, config.server_address
    ));

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                events.detail("[*] forward stopped");
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

                let connector = connector.clone();
                let server_name = server_name.clone();
                let config = config.clone();
                let events = events.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _guard = ConnectionGuard::new();
                    tokio::select! {
                        biased;
                        () = conn_shutdown.cancelled() => {}
                        () = handle_forward(
                            stream,
                            peer,
                            connector,
                            server_name,
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

async fn handle_forward(
    mut local: TcpStream,
    peer: SocketAddr,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    config: Arc<ListenConfig>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) {
    let raw = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&config.server_address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.report(format!(
                "[x] connect [{}] error [{e}]",
                config.server_address
            ));
            let _ = local.write_all(e.to_string().as_bytes()).await;
            return;
        }
        Err(_) => {
            events.report(format!("[x] connect [{}] timed out", config.server_address));
            let _ = local.write_all(b"connect timed out").await;
            return;
        }
    };

    let mut tls_stream = match timeout(CONNECT_TIMEOUT, connector.connect(server_name, raw)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.report(format!("[x] handshake failed: [{e}]"));
            let _ = local.write_all(e.to_string().as_bytes()).await;
            return;
        }
        Err(_) => {
            events.report("[x] handshake timed out");
            let _ = local.write_all(b"handshake timed out").await;
            return;
        }
    };

    if let Err(e) = secret::authenticate_client(&mut tls_stream, &config.secret).await {
        events.detail(format!("[x] authentication reply error: [{e}]"));
        let _ = local.write_all(e.to_string().as_bytes()).await;
        return;
    }

    let (up, down) = relay::splice(local, tls_stream, &shutdown).await;
    events.detail(format!(
        "[-] client [{peer}] disconnected: {up}/{down} bytes"
    ));
}

/// SNI value for the server dial. Trust comes from the pin alone, but
/// rustls still wants a name on the wire.
fn server_name(address: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host_part(address).to_string())
        .map_err(|_| Error::Config(format!("invalid server address {address}")))
}

/// Host portion of `host:port`; IPv6 brackets are stripped.
fn host_part(address: &str) -> &str {
    if address.starts_with('[') {
        if let Some(end) = address.find(']') {
            return &address[1..end];
        }
    }
    if let Some((host, _port)) = address.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') {
            return host;
        }
    }
    address
}

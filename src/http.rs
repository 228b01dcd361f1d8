use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::logsink::EventLog;
use crate::peek::PeekedStream;
use crate::{relay, CONNECT_TIMEOUT};

/// Serve HTTP/1.x proxy requests on an authenticated tunnel connection.
///
/// The stream arrives wrapped in the peek adapter so the request bytes
/// already pulled into user space during protocol sniffing reach the
/// parser. CONNECT requests upgrade into an opaque relay; anything else is
/// forwarded to the origin with headers preserved verbatim, duplicates and
/// hop-by-hop headers included.
pub(crate) async fn serve<S>(
    stream: PeekedStream<S>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc_events = events.clone();
    let svc_shutdown = shutdown.clone();
    let service =
        service_fn(move |req| handle_request(req, svc_events.clone(), svc_shutdown.clone()));

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        biased;
        () = shutdown.cancelled() => {}
        result = conn => {
            if let Err(e) = result {
                let text = e.to_string();
                if !text.contains("connection closed") {
                    events.detail(format!("[x] http error [{text}]"));
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        handle_tunneling(req, events, shutdown).await
    } else {
        handle_forwarding(req, events).await
    }
}

/// CONNECT: dial the authority, answer `200 Connection Established`, and
/// splice the upgraded connection with the origin.
async fn handle_tunneling(
    req: Request<Incoming>,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(addr) = host_addr(req.uri()) else {
        events.detail(format!(
            "[x] CONNECT host is not a socket address [{}]",
            req.uri()
        ));
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "CONNECT must be to a socket address",
        ));
    };

    let origin = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.detail(format!("[x] connect [{addr}] error [{e}]"));
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
            ));
        }
        Err(_) => {
            events.detail(format!("[x] connect [{addr}] timed out"));
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "connect timed out",
            ));
        }
    };
    events.detail(format!("[+] connect to [{addr}] success"));

    let tunnel_events = events.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let (up, down) =
                    relay::splice(TokioIo::new(upgraded), origin, &shutdown).await;
                tunnel_events.detail(format!(
                    "[-] tunnel to [{addr}] closed: {up}/{down} bytes"
                ));
            }
            Err(e) => tunnel_events.detail(format!("[x] upgrade error [{e}]")),
        }
    });

    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    Ok(resp)
}

/// Plain HTTP: replay the request on a fresh origin connection and stream
/// the response back.
async fn handle_forwarding(
    req: Request<Incoming>,
    events: Arc<EventLog>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(host) = req.uri().host() else {
        events.detail(format!("[x] http request missing host [{}]", req.uri()));
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "HTTP request missing host",
        ));
    };
    let port = req.uri().port_u16().unwrap_or(80);
    let addr = format!("{host}:{port}");

    let origin = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            events.detail(format!("[x] connect [{addr}] error [{e}]"));
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
            ));
        }
        Err(_) => {
            events.detail(format!("[x] connect [{addr}] timed out"));
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "connect timed out",
            ));
        }
    };
    events.detail(format!("[+] connect to [{addr}] success"));

    let io = TokioIo::new(origin);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;

    let conn_events = events.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let text = e.to_string();
            if !text.contains("connection closed") {
                conn_events.detail(format!("[x] http connection error [{text}]"));
            }
        }
    });

    let resp = sender.send_request(req).await?;
    Ok(resp.map(|body| body.boxed()))
}

fn host_addr(uri: &hyper::Uri) -> Option<String> {
    uri.authority().map(|authority| authority.to_string())
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(message.to_string()));
    *resp.status_mut() = status;
    resp
}

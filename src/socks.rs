use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub(crate) mod v5 {
    pub const VERSION: u8 = 0x05;

    pub const METH_NO_AUTH: u8 = 0x00;
    pub const METH_NONE_ACCEPTABLE: u8 = 0xFF;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
}

/// Success reply for a completed CONNECT: BND.ADDR 0.0.0.0, BND.PORT 0.
const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

fn proto_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Parse the method selection and CONNECT request, returning the target as
/// `host:port`. The caller has peeked (not consumed) the version byte.
///
/// Only the no-auth method is offered. `CMD` is read but not checked:
/// everything gets CONNECT semantics, so BIND and UDP ASSOCIATE fail at
/// dial time.
pub(crate) async fn read_request<S>(conn: &mut BufReader<S>) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = conn.read_u8().await?;
    if version != v5::VERSION {
        return Err(proto_err("invalid socks5 version"));
    }
    let n_methods = conn.read_u8().await? as usize;
    if n_methods == 0 {
        return Err(proto_err("invalid socks5 nmethods"));
    }

    let mut methods = vec![0u8; n_methods];
    conn.read_exact(&mut methods).await?;
    if !methods.contains(&v5::METH_NO_AUTH) {
        let _ = conn
            .get_mut()
            .write_all(&[v5::VERSION, v5::METH_NONE_ACCEPTABLE])
            .await;
        return Err(proto_err("no acceptable auth method"));
    }
    conn.get_mut()
        .write_all(&[v5::VERSION, v5::METH_NO_AUTH])
        .await?;

    // VER, CMD, RSV, ATYP
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).await?;
    if header[0] != v5::VERSION {
        return Err(proto_err("invalid socks5 request version"));
    }

    let host = match header[3] {
        v5::ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            conn.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        v5::ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            conn.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        v5::ATYP_DOMAIN => {
            let len = conn.read_u8().await? as usize;
            if len == 0 {
                return Err(proto_err("invalid domain length"));
            }
            let mut domain = vec![0u8; len];
            conn.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| proto_err("invalid domain name"))?
        }
        _ => return Err(proto_err("unsupported socks5 address type")),
    };

    let port = conn.read_u16().await?;
    Ok(join_host_port(&host, port))
}

/// Write the constant success reply once the origin dial has succeeded.
pub(crate) async fn write_success<W>(conn: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    conn.write_all(&SUCCESS_REPLY).await
}

/// `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

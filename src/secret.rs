use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::{AUTH_REPLY_TIMEOUT, MAX_SECRET_LINE, REPLY_SUCCESS};

/// Server side of the shared-secret handshake.
///
/// Reads one newline-terminated line, trims surrounding whitespace, and
/// compares it with `secret`. On a match the single success byte is
/// written; on any mismatch or read failure the caller closes the
/// connection without writing anything, leaving the peer to time out.
pub(crate) async fn authenticate_server<S>(conn: &mut BufReader<S>, secret: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_secret_line(conn).await?;
    if line.trim() != secret {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "secret not match",
        ));
    }
    conn.get_mut().write_all(&[REPLY_SUCCESS]).await?;
    Ok(())
}

/// Bounded line read. The cap protects the pre-auth path from unbounded
/// buffering by unauthenticated peers.
async fn read_secret_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_SECRET_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "secret line too long",
            ));
        }
    }
    String::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "secret not valid utf-8"))
}

/// Client side: send the secret line, then require the success byte within
/// five seconds. Timeout, close, and a wrong byte are all reported as the
/// same authentication failure.
pub(crate) async fn authenticate_client<S>(conn: &mut S, secret: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(format!("{secret}\n").as_bytes()).await?;
    conn.flush().await?;

    let mut reply = [0u8; 1];
    match timeout(AUTH_REPLY_TIMEOUT, conn.read_exact(&mut reply)).await {
        Ok(Ok(_)) if reply[0] == REPLY_SUCCESS => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "authentication failed",
        )),
    }
}

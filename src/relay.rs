use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{buffer_pool, IDLE_TIMEOUT};

/// Bidirectional copy between two connected streams.
///
/// Each direction runs independently and ends on EOF, I/O error, or 60
/// seconds without activity; a finished direction half-closes its
/// destination so the opposite direction keeps flowing. Cancellation closes
/// both streams. Errors are termination signals, not failures: the relay is
/// a best-effort splice and reports only the bytes copied per direction.
pub(crate) async fn splice<A, B>(a: A, b: B, shutdown: &CancellationToken) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    splice_with_idle(a, b, IDLE_TIMEOUT, shutdown).await
}

pub(crate) async fn splice_with_idle<A, B>(
    a: A,
    b: B,
    idle: Duration,
    shutdown: &CancellationToken,
) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    tokio::select! {
        biased;
        // Dropping the copy futures drops both halves of both streams,
        // which closes the sockets and unblocks the peers.
        () = shutdown.cancelled() => (0, 0),
        totals = async {
            tokio::join!(
                copy_half(a_read, b_write, idle),
                copy_half(b_read, a_write, idle),
            )
        } => totals,
    }
}

/// Copy `src` into `dst` until EOF, error, or `idle` without progress,
/// then half-close `dst`. The deadline is refreshed before every read and
/// every write.
async fn copy_half<R, W>(mut src: ReadHalf<R>, mut dst: WriteHalf<W>, idle: Duration) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = buffer_pool::get_buffer().await;
    let mut copied = 0u64;

    loop {
        let n = match timeout(idle, src.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => n,
        };
        match timeout(idle, dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => copied += n as u64,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    let _ = timeout(idle, dst.shutdown()).await;
    buffer_pool::return_buffer(buf).await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn delivers_bytes_in_both_directions_and_half_closes() {
        let (mut client, near) = duplex(1024);
        let (far, mut origin) = duplex(1024);
        let token = CancellationToken::new();
        let relay_token = token.clone();

        let relay = tokio::spawn(async move {
            splice_with_idle(near, far, Duration::from_secs(5), &relay_token).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client write-close propagates as EOF to the origin while the
        // origin side can still answer.
        client.shutdown().await.unwrap();
        assert_eq!(origin.read(&mut buf).await.unwrap(), 0);

        origin.shutdown().await.unwrap();
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 5);
    }

    #[tokio::test]
    async fn idle_direction_terminates() {
        let (_client, near) = duplex(1024);
        let (far, _origin) = duplex(1024);
        let token = CancellationToken::new();

        let totals = timeout(
            Duration::from_secs(2),
            splice_with_idle(near, far, Duration::from_millis(50), &token),
        )
        .await
        .expect("relay should end after the idle deadline");
        assert_eq!(totals, (0, 0));
    }

    #[tokio::test]
    async fn cancellation_closes_both_streams() {
        let (mut client, near) = duplex(1024);
        let (far, mut origin) = duplex(1024);
        let token = CancellationToken::new();
        let relay_token = token.clone();

        let relay = tokio::spawn(async move {
            splice_with_idle(near, far, Duration::from_secs(60), &relay_token).await
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        origin.read_exact(&mut buf).await.unwrap();

        token.cancel();
        timeout(Duration::from_millis(500), relay)
            .await
            .expect("relay should join promptly after cancellation")
            .unwrap();

        // Both ends observe the close.
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(origin.read(&mut buf).await.unwrap(), 0);
    }
}

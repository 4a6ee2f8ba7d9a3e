//! Bidirectional splice ("IoBind"): two independent copy tasks over a
//! client socket and an outbound socket, with shared cancellation so that
//! either side finishing tears down both.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::Error;

/// Splice `client` and `outbound` until either direction ends (EOF or
/// error), then cancel the other direction and close both sockets.
/// `on_bytes` is invoked per chunk as `(bytes_transferred,
/// is_client_to_outbound)`. Returns the terminal error of whichever
/// direction finished first, or `None` on a clean EOF.
pub async fn splice<A, B>(
    client: A,
    outbound: B,
    on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync>,
) -> Option<Error>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (outbound_r, outbound_w) = tokio::io::split(outbound);
    let (cancel_tx, cancel_rx1) = watch::channel(false);
    let cancel_rx2 = cancel_tx.subscribe();

    let mut h1 = tokio::spawn(copy_direction(
        client_r,
        outbound_w,
        on_bytes.clone(),
        true,
        cancel_tx.clone(),
        cancel_rx1,
    ));
    let mut h2 = tokio::spawn(copy_direction(
        outbound_r,
        client_w,
        on_bytes,
        false,
        cancel_tx.clone(),
        cancel_rx2,
    ));

    let first_result;
    let second_handle;
    tokio::select! {
        r = &mut h1 => {
            first_result = r.unwrap_or(None);
            second_handle = h2;
        }
        r = &mut h2 => {
            first_result = r.unwrap_or(None);
            second_handle = h1;
        }
    }
    let _ = cancel_tx.send(true);
    tokio::spawn(async move {
        let _ = second_handle.await;
    });
    first_result
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync>,
    is_client_to_outbound: bool,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Option<Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = [0u8; 8192];
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => break None,
            res = reader.read(&mut buf) => {
                match res {
                    Ok(0) => break None,
                    Ok(n) => {
                        on_bytes(n as u64, is_client_to_outbound);
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            break Some(Error::Io(e));
                        }
                    }
                    Err(e) => break Some(Error::Io(e)),
                }
            }
        }
    };
    // A blocked peer on the other direction is unwedged by the cancel
    // signal above; give our own write side a short grace window to flush
    // before the socket drops.
    let _ = cancel_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_millis(1), writer.shutdown()).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_forwards_both_directions() {
        let (client_side, mut client_peer) = tokio::io::duplex(256);
        let (outbound_side, mut outbound_peer) = tokio::io::duplex(256);

        let client_to_outbound = Arc::new(AtomicU64::new(0));
        let outbound_to_client = Arc::new(AtomicU64::new(0));
        let c2o = client_to_outbound.clone();
        let o2c = outbound_to_client.clone();
        let on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync> = Arc::new(move |n, is_c2o| {
            if is_c2o {
                c2o.fetch_add(n, Ordering::SeqCst);
            } else {
                o2c.fetch_add(n, Ordering::SeqCst);
            }
        });

        let splice_handle = tokio::spawn(splice(client_side, outbound_side, on_bytes));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        outbound_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        outbound_peer.write_all(b"pong").await.unwrap();
        let mut buf2 = [0u8; 4];
        client_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"pong");

        drop(client_peer);
        drop(outbound_peer);
        let _ = splice_handle.await;

        assert_eq!(client_to_outbound.load(Ordering::SeqCst), 4);
        assert_eq!(outbound_to_client.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_splice_ends_when_either_side_closes() {
        let (client_side, client_peer) = tokio::io::duplex(256);
        let (outbound_side, _outbound_peer_keep_alive) = tokio::io::duplex(256);

        let on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync> = Arc::new(|_, _| {});
        let splice_handle = tokio::spawn(splice(client_side, outbound_side, on_bytes));

        drop(client_peer);

        let result = tokio::time::timeout(Duration::from_secs(2), splice_handle)
            .await
            .expect("splice should complete promptly after one side closes");
        assert!(result.is_ok());
    }
}

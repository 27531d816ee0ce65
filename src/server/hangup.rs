//! Out-of-band detection of a client hanging up.
//!
//! russh stops reading the socket while an authentication callback runs, so a
//! client that disconnects mid-login goes unnoticed until the callback returns.
//! A duplicate of the socket is watched instead; it only peeks and never
//! consumes bytes meant for the SSH session.

use std::io;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between checks while unread data sits in the socket buffer.
const PENDING_DATA_BACKOFF: Duration = Duration::from_millis(250);

/// Split an accepted stream into the stream for the session and a watch handle
/// on the same socket.
pub(crate) fn with_watch(stream: TcpStream) -> io::Result<(TcpStream, TcpStream)> {
    let stream = stream.into_std()?;
    let watch = stream.try_clone()?;
    Ok((TcpStream::from_std(stream)?, TcpStream::from_std(watch)?))
}

/// Resolves once the peer has closed its end or the socket has failed.
pub(crate) async fn peer_closed(watch: &TcpStream) {
    let mut buf = [0u8; 1];
    loop {
        let ready = match watch.ready(Interest::READABLE).await {
            Ok(ready) => ready,
            Err(_) => return,
        };
        if ready.is_read_closed() {
            return;
        }
        match watch.peek(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(PENDING_DATA_BACKOFF).await,
        }
    }
}

/// Cancel `cancel` when the peer goes away. Ends early once `cancel` fires.
pub(crate) async fn watch_peer(watch: TcpStream, cancel: CancellationToken, conn_id: u64) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = peer_closed(&watch) => {
            debug!(conn_id, "Client hung up");
            cancel.cancel();
        }
    }
}

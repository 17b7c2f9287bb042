//! Copying bytes between a local TCP connection and a tunnelled stream.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Bytes moved by one bridged connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Local side to tunnel.
    pub sent: u64,
    /// Tunnel to local side.
    pub received: u64,
}

/// Copy in both directions until both sides finish or `cancel` fires.
pub(crate) async fn bridge<L, R>(
    mut local: L,
    remote: R,
    cancel: CancellationToken,
) -> io::Result<BridgeStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite,
{
    let mut remote = Box::pin(remote);
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
            let (sent, received) = result?;
            Ok(BridgeStats { sent, received })
        }
        _ = cancel.cancelled() => Ok(BridgeStats::default()),
    }
}

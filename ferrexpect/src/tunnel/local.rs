//! Local forwarding: a local listener whose connections are carried to a
//! fixed `host:port` through the SSH connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::bridge::bridge;
use crate::error::{Result, TunnelError};
use crate::transport::Transport;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until cancelled, running `handle` for each on its own task.
///
/// Connection tasks are aborted when the loop ends, and the listener is
/// dropped before this returns.
pub(crate) async fn serve<F, Fut>(listener: TcpListener, cancel: CancellationToken, mut handle: F)
where
    F: FnMut(TcpStream, SocketAddr, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted tunnel connection from {}", peer);
                    let task = handle(stream, peer, cancel.child_token());
                    connections.spawn(async move {
                        if let Err(e) = task.await {
                            warn!("tunnel connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("tunnel accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
}

/// Worker body for a local forward.
pub(crate) async fn run<T: Transport>(
    listener: TcpListener,
    transport: Arc<T>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    serve(listener, cancel, move |stream, peer, cancel| {
        let transport = transport.clone();
        let remote_host = remote_host.clone();
        async move {
            let channel = transport
                .open_direct_tcpip(&remote_host, remote_port, peer)
                .await?;
            let stats = bridge(stream, channel, cancel)
                .await
                .map_err(TunnelError::Io)?;
            debug!(
                "local forward {} -> {}:{} done ({} bytes out, {} bytes in)",
                peer, remote_host, remote_port, stats.sent, stats.received
            );
            Ok(())
        }
    })
    .await;
}

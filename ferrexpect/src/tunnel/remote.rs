//! Remote forwarding: the server listens, and each connection it forwards
//! back is bridged to a fixed local `host:port`.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::bridge::bridge;
use crate::error::{Result, TunnelError};
use crate::transport::{ForwardedConnection, RemoteListener, Transport};

/// Worker body for a remote forward.
///
/// On cancellation the server-side listener is cancelled too, best effort.
pub(crate) async fn run<T: Transport>(
    mut listener: RemoteListener<T::Stream>,
    transport: Arc<T>,
    bind_addr: String,
    local_host: String,
    local_port: u16,
    cancel: CancellationToken,
) {
    let bound_port = listener.bound_port();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            incoming = listener.accept() => match incoming {
                Some(connection) => {
                    let local_host = local_host.clone();
                    let cancel = cancel.child_token();
                    connections.spawn(async move {
                        let origin = format!("{}:{}", connection.originator, connection.originator_port);
                        if let Err(e) = deliver(connection, &local_host, local_port, cancel).await {
                            warn!("remote forward connection from {} failed: {}", origin, e);
                        }
                    });
                }
                None => {
                    info!("remote forward on port {} closed by the transport", bound_port);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    if let Err(e) = transport.cancel_remote_forward(&bind_addr, bound_port).await {
        warn!(
            "could not cancel remote forward on {}:{}: {}",
            bind_addr, bound_port, e
        );
    }
    connections.shutdown().await;
}

async fn deliver<S>(
    connection: ForwardedConnection<S>,
    local_host: &str,
    local_port: u16,
    cancel: CancellationToken,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    let local = TcpStream::connect((local_host, local_port))
        .await
        .map_err(TunnelError::Io)?;
    let stats = bridge(local, connection.stream, cancel)
        .await
        .map_err(TunnelError::Io)?;
    debug!(
        "remote forward to {}:{} done ({} bytes out, {} bytes in)",
        local_host, local_port, stats.sent, stats.received
    );
    Ok(())
}

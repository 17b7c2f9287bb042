//! Dynamic forwarding: a local SOCKS proxy whose CONNECT requests are
//! carried through the SSH connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::bridge::bridge;
use super::local::serve;
use super::socks;
use crate::error::{Result, TunnelError};
use crate::transport::Transport;

/// Worker body for a dynamic forward.
pub(crate) async fn run<T: Transport>(
    listener: TcpListener,
    transport: Arc<T>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    serve(listener, cancel, move |stream, peer, cancel| {
        let transport = transport.clone();
        async move { proxy(stream, peer, &*transport, handshake_timeout, cancel).await }
    })
    .await;
}

async fn proxy<T: Transport>(
    mut stream: TcpStream,
    peer: SocketAddr,
    transport: &T,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let request = tokio::time::timeout(handshake_timeout, socks::read_request(&mut stream))
        .await
        .map_err(|_| TunnelError::Socks(format!("handshake timed out after {handshake_timeout:?}")))??;
    debug!(
        "SOCKS {:?} request from {} for {}:{}",
        request.version, peer, request.host, request.port
    );

    let channel = match transport
        .open_direct_tcpip(&request.host, request.port, peer)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            let _ = socks::send_reply(&mut stream, request.version, false).await;
            return Err(e);
        }
    };
    socks::send_reply(&mut stream, request.version, true).await?;

    let stats = bridge(stream, channel, cancel)
        .await
        .map_err(TunnelError::Io)?;
    debug!(
        "SOCKS connection {} -> {}:{} done ({} bytes out, {} bytes in)",
        peer, request.host, request.port, stats.sent, stats.received
    );
    Ok(())
}

//! Registry of running tunnels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{TeardownReport, TunnelConfig, TunnelHandle, TunnelKey, dynamic, local, remote};
use crate::error::{Result, TunnelError};
use crate::transport::Transport;

struct Tunnel {
    handle: TunnelHandle,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Starts tunnel workers and stops them again.
///
/// Tunnels are kept in creation order. Requesting a tunnel whose key is
/// already registered returns the existing handle while its worker is alive.
pub struct TunnelManager {
    config: TunnelConfig,
    tunnels: IndexMap<TunnelKey, Tunnel>,
    next_id: u64,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            tunnels: IndexMap::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Handles of all registered tunnels.
    pub fn handles(&self) -> Vec<TunnelHandle> {
        self.tunnels.values().map(|t| t.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Listen on `bind` and carry each connection to `remote_host:remote_port`.
    pub async fn forward_local<T: Transport>(
        &mut self,
        transport: &Arc<T>,
        bind: SocketAddr,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle> {
        let key = |local_port| TunnelKey::Local {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        };
        if let Some(handle) = self.existing(bind.port(), &key) {
            return Ok(handle);
        }

        let listener = bind_listener(bind).await?;
        let local_addr = listener.local_addr().map_err(TunnelError::Io)?;
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(local::run(
            listener,
            transport.clone(),
            remote_host.to_string(),
            remote_port,
            cancel.clone(),
        ));

        Ok(self.register(key(local_addr.port()), local_addr.port(), Some(local_addr), cancel, worker))
    }

    /// Have the server listen on `bind_addr:remote_port` and deliver each
    /// connection to `local_host:local_port`.
    pub async fn forward_remote<T: Transport>(
        &mut self,
        transport: &Arc<T>,
        bind_addr: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<TunnelHandle> {
        let key = |remote_port| TunnelKey::Remote {
            remote_port,
            local_host: local_host.to_string(),
            local_port,
        };
        if let Some(handle) = self.existing(remote_port, &key) {
            return Ok(handle);
        }

        let listener = transport.request_remote_forward(bind_addr, remote_port).await?;
        let bound_port = listener.bound_port();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(remote::run(
            listener,
            transport.clone(),
            bind_addr.to_string(),
            local_host.to_string(),
            local_port,
            cancel.clone(),
        ));

        Ok(self.register(key(bound_port), bound_port, None, cancel, worker))
    }

    /// Run a SOCKS proxy on `bind`.
    pub async fn forward_dynamic<T: Transport>(
        &mut self,
        transport: &Arc<T>,
        bind: SocketAddr,
    ) -> Result<TunnelHandle> {
        let key = |local_port| TunnelKey::Dynamic { local_port };
        if let Some(handle) = self.existing(bind.port(), &key) {
            return Ok(handle);
        }

        let listener = bind_listener(bind).await?;
        let local_addr = listener.local_addr().map_err(TunnelError::Io)?;
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(dynamic::run(
            listener,
            transport.clone(),
            self.config.handshake_timeout,
            cancel.clone(),
        ));

        Ok(self.register(key(local_addr.port()), local_addr.port(), Some(local_addr), cancel, worker))
    }

    /// Stop one tunnel. Unknown or already closed handles are ignored.
    pub async fn close(&mut self, handle: &TunnelHandle) -> Result<()> {
        let registered = self
            .tunnels
            .get(handle.key())
            .is_some_and(|t| t.handle.id() == handle.id());
        if !registered {
            debug!("tunnel {} is not registered", handle.key());
            return Ok(());
        }

        let Some(tunnel) = self.tunnels.shift_remove(handle.key()) else {
            return Ok(());
        };
        info!("closing tunnel {}", tunnel.handle.key());
        tunnel.cancel.cancel();
        stop(tunnel.worker, self.config.join_timeout).await?;
        Ok(())
    }

    /// Stop every tunnel concurrently and report the ones that did not stop cleanly.
    pub async fn close_all(&mut self) -> TeardownReport {
        let tunnels: Vec<Tunnel> = self.tunnels.drain(..).map(|(_, t)| t).collect();
        if tunnels.is_empty() {
            return TeardownReport::default();
        }

        info!("closing {} tunnel(s)", tunnels.len());
        for tunnel in &tunnels {
            tunnel.cancel.cancel();
        }

        let join_timeout = self.config.join_timeout;
        let results = join_all(tunnels.into_iter().map(|tunnel| async move {
            let key = tunnel.handle.key().clone();
            (key, stop(tunnel.worker, join_timeout).await)
        }))
        .await;

        let mut report = TeardownReport::default();
        for (key, result) in results {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!("tunnel {} did not stop cleanly: {}", key, e);
                    report.failures.push((key, e));
                }
            }
        }
        report
    }

    /// Live handle for a key built from `port`, unless `port` is 0 (always a
    /// new listener). A dead worker is unregistered so the caller replaces it.
    fn existing(&mut self, port: u16, key: impl Fn(u16) -> TunnelKey) -> Option<TunnelHandle> {
        if port == 0 {
            return None;
        }
        let key = key(port);
        let tunnel = self.tunnels.get(&key)?;
        if !tunnel.worker.is_finished() {
            debug!("reusing tunnel {}", key);
            return Some(tunnel.handle.clone());
        }

        warn!("tunnel {} stopped on its own, replacing it", key);
        self.tunnels.shift_remove(&key);
        None
    }

    fn register(
        &mut self,
        key: TunnelKey,
        bound_port: u16,
        local_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    ) -> TunnelHandle {
        self.next_id += 1;
        let handle = TunnelHandle::new(self.next_id, key.clone(), bound_port, local_addr);
        info!("tunnel {} started", key);
        self.tunnels.insert(
            key,
            Tunnel {
                handle: handle.clone(),
                cancel,
                worker,
            },
        );
        handle
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        for tunnel in self.tunnels.values() {
            tunnel.cancel.cancel();
        }
    }
}

async fn bind_listener(addr: SocketAddr) -> std::result::Result<TcpListener, TunnelError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TunnelError::Bind { addr, source })
}

/// Wait up to `timeout` for a cancelled worker, aborting it past that.
async fn stop(mut worker: JoinHandle<()>, timeout: Duration) -> std::result::Result<(), TunnelError> {
    match tokio::time::timeout(timeout, &mut worker).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_cancelled() => Ok(()),
        Ok(Err(e)) => Err(TunnelError::Worker(e.to_string())),
        Err(_) => {
            worker.abort();
            let _ = worker.await;
            Err(TunnelError::ShutdownTimeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_stop_finished_worker() {
        let worker = tokio::spawn(async {});
        assert!(stop(worker, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_worker() {
        let worker = tokio::spawn(std::future::pending::<()>());
        let err = stop(worker, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TunnelError::ShutdownTimeout(_)));
    }

    #[tokio::test]
    async fn test_stop_reports_panicked_worker() {
        let worker = tokio::spawn(async { panic!("boom") });
        let err = stop(worker, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Worker(_)));
    }

    #[tokio::test]
    async fn test_close_all_on_empty_manager() {
        let mut manager = TunnelManager::new(TunnelConfig::default());
        let report = manager.close_all().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, 0);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_close_unknown() {
        let mut manager = TunnelManager::new(TunnelConfig::default());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = tokio::spawn(async move { token.cancelled().await });
        let handle = manager.register(TunnelKey::Dynamic { local_port: 1080 }, 1080, None, cancel, worker);

        assert_eq!(manager.handles(), vec![handle.clone()]);
        assert_eq!(manager.existing(1080, |p| TunnelKey::Dynamic { local_port: p }), Some(handle.clone()));

        let stale = TunnelHandle::new(99, handle.key().clone(), 1080, None);
        manager.close(&stale).await.unwrap();
        assert_eq!(manager.len(), 1);

        manager.close(&handle).await.unwrap();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_collects_failures_and_closes_the_rest() {
        let config = TunnelConfig {
            join_timeout: Duration::from_millis(100),
            ..TunnelConfig::default()
        };
        let mut manager = TunnelManager::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(local::serve(listener, cancel.clone(), |_stream, _peer, _cancel| async {
            Ok(())
        }));
        manager.register(TunnelKey::Dynamic { local_port: addr.port() }, addr.port(), Some(addr), cancel, worker);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            token.cancelled().await;
            panic!("teardown failed");
        });
        manager.register(TunnelKey::Dynamic { local_port: 1 }, 1, None, cancel, worker);

        // never looks at its token
        let worker = tokio::spawn(std::future::pending::<()>());
        manager.register(TunnelKey::Dynamic { local_port: 2 }, 2, None, CancellationToken::new(), worker);

        assert!(TcpStream::connect(addr).await.is_ok());

        let report = manager.close_all().await;
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(!report.is_clean());
        assert!(matches!(
            report.failures[0],
            (TunnelKey::Dynamic { local_port: 1 }, TunnelError::Worker(_))
        ));
        assert!(matches!(
            report.failures[1],
            (TunnelKey::Dynamic { local_port: 2 }, TunnelError::ShutdownTimeout(_))
        ));

        assert!(manager.is_empty());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

//! Engine lifecycle.
//!
//! [`Engine`] owns every background task the library runs: the discovery
//! listener, the presence broadcaster, the handshake listener, and the
//! transfer sessions. Each role hangs off a child of one root cancellation
//! token, so a role can stop on its own while [`Engine::shutdown`] still
//! stops everything, waiting out a grace period before aborting stragglers.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{self, Peer};
use crate::error::Result;
use crate::handshake::{self, AcceptDecision};
use crate::transfer::{self, TransferEvent, EVENT_CHANNEL_CAPACITY};

/// The library's top-level handle.
pub struct Engine {
    config: Config,
    root: CancellationToken,
    discovery: Mutex<Option<CancellationToken>>,
    receiving: Mutex<Option<CancellationToken>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Engine {
    /// Create an engine with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            root: CancellationToken::new(),
            discovery: Mutex::new(None),
            receiving: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The configuration this engine runs with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Start listening for peers announcing themselves on the subnet.
    ///
    /// Each discovered peer is reported once on the returned channel.
    /// Calling this again restarts discovery with a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery socket cannot be bound.
    pub async fn start_discovery(&self) -> Result<mpsc::Receiver<Peer>> {
        let mut slot = self.discovery.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let cancel = self.root.child_token();
        let peers = discovery::discover_peers(
            self.config.network.discovery_port,
            discovery::local_ip(),
            cancel.clone(),
        )?;
        *slot = Some(cancel);
        Ok(peers)
    }

    /// Stop listening for peer announcements.
    pub async fn stop_discovery(&self) {
        if let Some(cancel) = self.discovery.lock().await.take() {
            cancel.cancel();
            debug!("discovery stopped");
        }
    }

    /// Ask `peer` for permission to send `files`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot be reached or does not answer.
    pub async fn request_connection(
        &self,
        peer: &Peer,
        local_name: &str,
        files: &[PathBuf],
    ) -> Result<bool> {
        handshake::request_transfer(
            peer.addr,
            self.config.network.handshake_port,
            local_name,
            files,
            self.config.transfer.io_timeout(),
            self.config.transfer.decision_timeout(),
        )
        .await
    }

    /// Start sending `files` to `peer`, consent already given.
    ///
    /// The discovery phase ends here: peer browsing stops before the
    /// transfer coordinator starts. Progress and the terminal outcome
    /// arrive on the returned channel.
    pub async fn start_sending(
        &self,
        peer: &Peer,
        files: Vec<PathBuf>,
    ) -> mpsc::Receiver<TransferEvent> {
        self.stop_discovery().await;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let config = self.config.clone();
        let cancel = self.root.child_token();
        let addr = peer.addr;

        info!(peer = %peer, files = files.len(), "starting send session");
        self.tasks.lock().await.spawn(async move {
            transfer::send_files(addr, config, files, tx, cancel).await;
        });
        rx
    }

    /// Become visible and ready to receive: announce `local_name` on the
    /// subnet, answer handshake requests with `decision`, and accept one
    /// transfer session into `save_dir`.
    ///
    /// Progress and the terminal outcome arrive on the returned channel.
    /// Calling this again restarts the receiving role.
    pub async fn start_receiving(
        &self,
        local_name: String,
        save_dir: PathBuf,
        decision: AcceptDecision,
    ) -> mpsc::Receiver<TransferEvent> {
        let mut slot = self.receiving.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let cancel = self.root.child_token();
        *slot = Some(cancel.clone());
        drop(slot);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let discovery_port = self.config.network.discovery_port;
        let handshake_port = self.config.network.handshake_port;
        let broadcast_interval = Duration::from_millis(self.config.network.broadcast_interval_ms);

        info!(name = %local_name, save_dir = %save_dir.display(), "starting receiving role");
        let mut tasks = self.tasks.lock().await;

        // Announcements belong to the discovery phase only. The handshake
        // task owns this token and fires it once a request is accepted, so
        // the peer disappears from browsers while the transfer runs.
        let announce_cancel = cancel.child_token();

        let announce_task_cancel = announce_cancel.clone();
        let announce_events = tx.clone();
        tasks.spawn(async move {
            let result = discovery::announce_presence(
                local_name,
                discovery_port,
                broadcast_interval,
                announce_task_cancel,
            )
            .await;
            if let Err(e) = result {
                warn!(error = %e, "presence announcements failed");
                let _ = announce_events
                    .send(TransferEvent::Status(format!(
                        "Presence announcements stopped: {e}"
                    )))
                    .await;
            }
        });

        let handshake_cancel = cancel.clone();
        let decision_timeout = self.config.transfer.decision_timeout();
        let handshake_events = tx.clone();
        tasks.spawn(async move {
            let result =
                handshake::serve_requests(handshake_port, decision, decision_timeout, handshake_cancel)
                    .await;
            if let Err(e) = result {
                warn!(error = %e, "handshake listener failed");
                let _ = handshake_events
                    .send(TransferEvent::Failed(format!(
                        "handshake listener failed: {e}"
                    )))
                    .await;
            }
            announce_cancel.cancel();
        });

        let config = self.config.clone();
        tasks.spawn(async move {
            transfer::receive_files(config, save_dir, tx, cancel).await;
        });

        rx
    }

    /// Stop announcing, answering handshakes, and accepting transfers.
    pub async fn stop_receiving(&self) {
        if let Some(cancel) = self.receiving.lock().await.take() {
            cancel.cancel();
            debug!("receiving role stopped");
        }
    }

    /// Stop everything: cancel all roles and sessions, wait out the grace
    /// period, then abort whatever is still running.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.root.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let grace = Duration::from_secs(self.config.transfer.shutdown_grace_secs);
        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("grace period elapsed, aborting remaining tasks");
            tasks.shutdown().await;
        }
        debug!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port_base: u16) -> Config {
        let mut config = Config::default();
        config.network.discovery_port = port_base;
        config.network.handshake_port = port_base + 1;
        config.network.transfer_port = port_base + 2;
        config
    }

    #[tokio::test]
    async fn discovery_restart_replaces_channel() {
        let engine = Engine::new(test_config(47_700));

        let first = engine.start_discovery().await.expect("start discovery");
        // SO_REUSEADDR lets the restarted listener bind the same port.
        let second = engine.start_discovery().await.expect("restart discovery");
        drop(second);

        engine.stop_discovery().await;
        drop(first);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn starting_a_send_closes_the_discovery_channel() {
        let engine = Engine::new(test_config(47_730));
        let mut peers = engine.start_discovery().await.expect("start discovery");

        let peer = Peer {
            name: "nobody".to_string(),
            addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        };
        let mut events = engine.start_sending(&peer, Vec::new()).await;

        // Peer browsing ends before the coordinator starts.
        let closed = timeout(Duration::from_secs(2), peers.recv())
            .await
            .expect("discovery channel should close");
        assert!(closed.is_none());

        while events.recv().await.is_some() {}
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn occupied_handshake_port_surfaces_a_failure_event() {
        let config = test_config(47_740);
        let _occupier = tokio::net::TcpListener::bind(("0.0.0.0", config.network.handshake_port))
            .await
            .expect("occupy handshake port");

        let dir = tempfile::TempDir::new().expect("temp dir");
        let engine = Engine::new(config);
        let decision: AcceptDecision = std::sync::Arc::new(|_: &str| false);
        let mut events = engine
            .start_receiving("busy".to_string(), dir.path().to_path_buf(), decision)
            .await;

        let message = loop {
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(TransferEvent::Failed(message))) => break message,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("expected a handshake failure event"),
            }
        };
        assert!(message.contains("handshake listener"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = Engine::new(test_config(47_710));
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stop_receiving_without_start_is_a_no_op() {
        let engine = Engine::new(test_config(47_720));
        engine.stop_receiving().await;
        engine.shutdown().await;
    }
}

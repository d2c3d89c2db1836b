//! Node assembly: capability workers, session listener and dialer, command
//! routing and the status endpoint, all tied to one shutdown broadcast.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use ethwire_core::config::{parse_enode, NodeConfig};
use ethwire_core::crypto::{Keypair, NodeId};
use ethwire_core::wire::{eth, par};
use ethwire_services::warp::{new_peer_table, ChunkDownloader, DownloaderActor};
use ethwire_services::{
    BlockChain, BlockQueue, CapabilityWorker, EthCapability, FileSnapshotStore, HostHandle, MemoryChain,
    ReputationRegistry, SnapshotStorage, SyncStatus, TransactionQueue, WarpCapability, WarpProgress,
};

use crate::dispatch::{route_commands, CapabilityRegistry};
use crate::session::initiator::SessionInitiator;
use crate::session::listener::SessionListener;
use crate::session::{new_session_table, SessionContext, SessionTable};
use crate::status::{self, StatusState};

/// Events buffered per capability worker before sessions wait.
const EVENT_BUFFER: usize = 256;

/// The chain-side collaborators the capabilities run against.
#[derive(Clone)]
pub struct NodeServices {
    pub chain: Arc<dyn BlockChain>,
    pub queue: Arc<dyn BlockQueue>,
    pub transactions: Arc<dyn TransactionQueue>,
}

impl NodeServices {
    /// Chain and block queue both backed by one in-memory chain.
    pub fn memory(chain: Arc<MemoryChain>, transactions: Arc<dyn TransactionQueue>) -> Self {
        Self {
            chain: chain.clone(),
            queue: chain,
            transactions,
        }
    }
}

pub struct Node {
    node_id: NodeId,
    listen_addr: SocketAddr,
    sessions: SessionTable,
    reputation: ReputationRegistry,
    sync: watch::Receiver<SyncStatus>,
    warp: Option<watch::Receiver<WarpProgress>>,
    shutdown: broadcast::Sender<()>,
    /// Subscribed at start so `wait` sees a shutdown sent before it runs.
    exit: broadcast::Receiver<()>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl Node {
    pub async fn start(
        config: &NodeConfig,
        keypair: Arc<Keypair>,
        services: NodeServices,
        reputation: ReputationRegistry,
    ) -> Result<Node> {
        config.validate()?;
        let node_id = keypair.node_id();
        let (shutdown, _) = broadcast::channel::<()>(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let request_timeout = config.sync.request_timeout();
        let tick = config.sync.tick_interval();
        let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();
        let mut registry = CapabilityRegistry::builder();

        // ── eth ──────────────────────────────────────────────────────────────

        let eth_capability = EthCapability::new(
            services.chain.clone(),
            services.queue.clone(),
            services.transactions.clone(),
            config.chain.clone(),
            request_timeout,
        );
        let sync = eth_capability.subscribe();
        let (eth_tx, eth_rx) = mpsc::channel(EVENT_BUFFER);
        let eth_host = HostHandle::new(eth::NAME, commands_tx.clone(), reputation.clone());
        tasks.push((
            "eth worker",
            tokio::spawn(CapabilityWorker::new(eth_capability, eth_host, eth_rx, tick, shutdown.subscribe()).run()),
        ));
        registry = registry.register(eth::NAME, &[eth::OLD_VERSION, eth::VERSION], eth_tx);

        // ── par ──────────────────────────────────────────────────────────────

        let warp = if config.sync.warp {
            std::fs::create_dir_all(&config.sync.snapshot_dir)
                .with_context(|| format!("failed to create {}", config.sync.snapshot_dir.display()))?;
            let store: Arc<dyn SnapshotStorage> = Arc::new(FileSnapshotStore::new(&config.sync.snapshot_dir));
            tracing::info!(dir = %config.sync.snapshot_dir.display(), "snapshot store ready");

            let peers = new_peer_table();
            let par_host = HostHandle::new(par::NAME, commands_tx.clone(), reputation.clone());
            let downloader = ChunkDownloader::new(
                config.sync.free_peer_buffer,
                config.sync.max_chunk_mismatches,
                request_timeout,
            );
            let (actor, handle) =
                DownloaderActor::new(downloader, par_host.clone(), store.clone(), peers.clone(), shutdown.subscribe());
            let progress = handle.progress.clone();
            tasks.push(("snapshot downloader", tokio::spawn(actor.run())));

            let warp_capability = WarpCapability::new(
                services.chain.clone(),
                store,
                config.chain.clone(),
                request_timeout,
                peers,
                Some(handle),
            );
            let (par_tx, par_rx) = mpsc::channel(EVENT_BUFFER);
            tasks.push((
                "par worker",
                tokio::spawn(CapabilityWorker::new(warp_capability, par_host, par_rx, tick, shutdown.subscribe()).run()),
            ));
            registry = registry.register(par::NAME, &[par::VERSION], par_tx);
            Some(progress)
        } else {
            None
        };

        // ── Sessions ─────────────────────────────────────────────────────────

        let listener = TcpListener::bind(&config.network.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
        let listen_addr = listener.local_addr()?;
        tracing::info!(addr = %listen_addr, node_id = %hex::encode(node_id), "listening for sessions");

        let sessions = new_session_table();
        let ctx = Arc::new(SessionContext::new(
            keypair,
            sessions.clone(),
            registry.build(),
            reputation.clone(),
            config.network.clone(),
            listen_addr.port(),
            shutdown.clone(),
        ));

        let mut bootnodes = Vec::new();
        for url in &config.network.bootnodes {
            match parse_enode(url) {
                Ok(node) => bootnodes.push(node),
                Err(e) => tracing::warn!(error = %e, "skipping bootnode"),
            }
        }

        tasks.push((
            "command router",
            tokio::spawn(route_commands(commands_rx, sessions.clone(), shutdown.subscribe())),
        ));
        tasks.push((
            "session listener",
            tokio::spawn(SessionListener::new(listener, ctx.clone(), shutdown.subscribe()).run()),
        ));
        tasks.push((
            "session initiator",
            tokio::spawn(SessionInitiator::new(bootnodes, ctx, shutdown.subscribe()).run()),
        ));

        // ── Status ───────────────────────────────────────────────────────────

        if config.status.port != 0 {
            let state = StatusState {
                node_id,
                sessions: sessions.clone(),
                reputation: reputation.clone(),
                sync: sync.clone(),
                warp: warp.clone(),
            };
            let port = config.status.port;
            let stop = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = status::serve(state, port, stop).await {
                    tracing::error!(error = %e, "status server failed");
                }
            });
        }

        Ok(Node {
            node_id,
            listen_addr,
            sessions,
            reputation,
            sync,
            warp,
            exit: shutdown.subscribe(),
            shutdown,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// `enode://` URL other nodes can use to dial this one.
    pub fn enode(&self) -> String {
        format!("enode://{}@{}", hex::encode(self.node_id), self.listen_addr)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn reputation(&self) -> &ReputationRegistry {
        &self.reputation
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.borrow().clone()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.sync.clone()
    }

    pub fn warp_progress(&self) -> Option<WarpProgress> {
        self.warp.as_ref().map(|w| w.borrow().clone())
    }

    /// Ask every task to stop. Sessions send ClientQuit on the way out.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested or any core task exits.
    pub async fn wait(mut self) -> Result<()> {
        let (names, handles): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks).into_iter().unzip();

        tokio::select! {
            _ = self.exit.recv() => tracing::info!("shutting down"),
            (result, index, _) = futures::future::select_all(handles) => {
                tracing::error!(task = names[index], result = ?result, "task exited");
                let _ = self.shutdown.send(());
            }
        }
        Ok(())
    }
}

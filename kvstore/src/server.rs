use crate::config::RuntimeConfig;
use crate::httpapi::{self, HttpKvApi};
use crate::metrics;
use crate::raft::node::{raft_logger, Node, NodeChannels, NodeOptions, PeerBook};
use crate::raft::storage::FileSnapshotStore;
use crate::raft_client::RaftClient;
use crate::raft_service::{self, RaftServiceSVC};
use crate::store::{KvStore, SnapshotBridge, StateTable, StoreError};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use parking_lot::RwLock;
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const MAILBOX_SIZE: usize = 1024;
const PROPOSAL_SIZE: usize = 1024;
const COMMIT_SIZE: usize = 64;

pub struct Server {
    config: RuntimeConfig,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn builder(config: RuntimeConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Server { config, shutdown }
    }

    /// Starts the raft node, its transport, the key-value API and the metrics
    /// endpoint. The returned handle is the apply loop; it resolves when the
    /// replica stops, with an error if it stopped on a fatal one.
    pub async fn start(&mut self) -> anyhow::Result<JoinHandle<Result<(), StoreError>>> {
        metrics::init_registry();

        let snapshot_dir = self.config.snapshot_dir();
        let snapshots = Arc::new(
            FileSnapshotStore::new(&snapshot_dir)
                .with_context(|| format!("cannot open snapshot dir {}", snapshot_dir.display()))?,
        );
        let table = Arc::new(StateTable::new());

        let (in_mailbox, my_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (out_tx, out_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (propose_tx, propose_rx) = mpsc::channel(PROPOSAL_SIZE);
        let (conf_tx, conf_rx) = mpsc::channel(16);
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_SIZE);
        let (error_tx, error_rx) = mpsc::channel(1);

        let peers: PeerBook = Arc::new(RwLock::new(
            self.config
                .node_list
                .iter()
                .filter(|n| n.id != self.config.id)
                .map(|n| (n.id, n.addr.clone()))
                .collect::<HashMap<_, _>>(),
        ));

        let options = NodeOptions {
            id: self.config.id,
            voters: self.config.voters(),
            join: self.config.join,
            snapshot_count: self.config.snapshot_count,
            snapshot_catch_up_entries: self.config.snapshot_catch_up_entries,
        };
        let channels = NodeChannels {
            my_mailbox,
            out_mailbox: out_tx,
            proposals: propose_rx,
            conf_changes: conf_rx,
            commits: commit_tx,
            errors: error_tx,
        };
        Node::start_raft(
            options,
            channels,
            SnapshotBridge::new(table.clone()),
            snapshots.clone(),
            peers.clone(),
            &raft_logger(),
        )?;

        tokio::spawn(RaftClient::builder(peers).run(out_mailbox));

        let raft_addr: SocketAddr = self.config.raft_addr.parse()?;
        raft_service::bind(raft_addr, RaftServiceSVC::new(in_mailbox), self.wait_shutdown())?;

        let (store, apply) =
            KvStore::open(table.clone(), propose_tx, commit_rx, error_rx, snapshots).await?;
        log::info!("node {} replayed, serving {} keys", self.config.id, table.len());

        let addr: SocketAddr = self.config.addr.parse()?;
        httpapi::bind(addr, Arc::new(HttpKvApi::new(store, conf_tx)), self.wait_shutdown())?;

        self.start_metrics_server()?;
        Ok(apply)
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
        let _ = self.shutdown.send(true);
    }

    fn wait_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.metrics_addr.parse()?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                            let mut response = Response::new(Body::empty());
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            return Ok::<_, hyper::Error>(response);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        let server = hyper::Server::try_bind(&addr)?
            .serve(make_svc)
            .with_graceful_shutdown(self.wait_shutdown());
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}

//! Raft client implementation
//!
//! This module provides functionality for sending Raft messages to other nodes
//! in the cluster over HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::raft::node::PeerBook;
use crate::raft_service::RAFT_PATH;

const PEER_CHANNEL_SIZE: usize = 1000;

#[derive(Debug, Error)]
enum TransportError {
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("request failed: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("peer answered {0}")]
    Status(StatusCode),
}

/// Client for a single peer node
struct PeerClient {
    /// Address the client posts to
    addr: String,
    /// Channel sender for queueing encoded messages to the peer
    sender: Sender<Vec<u8>>,
    /// Flag indicating if the client is invalid/needs reconnection
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    /// Creates a new peer client
    ///
    /// Messages are posted in order by a background task. The first failed
    /// post marks the client invalid; it is replaced on the next send and the
    /// raft protocol retransmits whatever was lost.
    fn new(http: Client<HttpConnector>, addr: String) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        let url = format!("{}{}", addr.trim_end_matches('/'), RAFT_PATH);
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&http, &url, receiver).await {
                log::error!("Streaming messages to {} failed: {}", url, e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });

        Self {
            addr,
            sender,
            invalid,
        }
    }

    async fn stream_messages(
        http: &Client<HttpConnector>,
        url: &str,
        mut receiver: Receiver<Vec<u8>>,
    ) -> Result<(), TransportError> {
        while let Some(data) = receiver.recv().await {
            let request = Request::builder()
                .method(Method::POST)
                .uri(url)
                .body(Body::from(data))?;
            let response = http.request(request).await?;
            if !response.status().is_success() {
                return Err(TransportError::Status(response.status()));
            }
        }
        Ok(())
    }
}

/// Client for managing connections to all peer nodes
pub struct RaftClient {
    /// Transport addresses of the peers
    peers: PeerBook,
    /// Map of peer IDs to their respective clients
    clients: HashMap<u64, PeerClient>,
    http: Client<HttpConnector>,
}

impl RaftClient {
    pub fn builder(peers: PeerBook) -> RaftClient {
        RaftClient {
            peers,
            clients: HashMap::new(),
            http: Client::new(),
        }
    }

    /// Forwards every message the raft node emits until the node stops.
    pub async fn run(mut self, mut out_mailbox: Receiver<RaftMessage>) {
        while let Some(msg) = out_mailbox.recv().await {
            self.post_data(msg);
        }
        log::info!("raft client stopped");
    }

    /// Sends a Raft message to a peer node
    ///
    /// Messages to unknown peers, or that do not fit in the peer's queue, are
    /// dropped. Raft resends what matters.
    pub fn post_data(&mut self, data: RaftMessage) {
        let addr = match self.peers.read().get(&data.to) {
            Some(addr) => addr.clone(),
            None => {
                log::debug!("no address for peer {}, dropping message", data.to);
                return;
            }
        };

        let stale = match self.clients.get(&data.to) {
            Some(client) => client.invalid.load(Ordering::SeqCst) || client.addr != addr,
            None => true,
        };
        if stale {
            let client = PeerClient::new(self.http.clone(), addr);
            self.clients.insert(data.to, client);
        }

        let bytes = match data.write_to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode raft message: {}", e);
                return;
            }
        };
        if let Some(client) = self.clients.get(&data.to) {
            if let Err(e) = client.sender.try_send(bytes) {
                log::debug!("Failed to queue message for peer {}: {}", data.to, e);
            }
        }
    }
}

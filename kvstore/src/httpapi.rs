//! HTTP key-value API
//!
//! `PUT`/`DELETE` propose a mutation and answer right away, `GET` reads the
//! local table, `POST /<node id>` asks the cluster to add a node.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use raft::prelude::{ConfChange, ConfChangeType};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use crate::metrics::record_metrics;
use crate::store::{KvStore, Operation};

const ALLOWED_METHODS: [&str; 4] = ["PUT", "GET", "POST", "DELETE"];

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

fn error(code: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", message)));
    *response.status_mut() = code;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Parses a node id the way an unsigned integer literal is written: `0x`
/// for hex, `0o` or a leading `0` for octal, `0b` for binary, decimal
/// otherwise. Zero is not a valid raft node id.
pub fn parse_node_id(s: &str) -> Option<u64> {
    let (digits, radix) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (rest, 2)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix)
        .ok()
        .filter(|id| *id != 0)
}

pub struct HttpKvApi {
    store: KvStore,
    conf_changes: Sender<ConfChange>,
}

impl HttpKvApi {
    pub fn new(store: KvStore, conf_changes: Sender<ConfChange>) -> Self {
        HttpKvApi {
            store,
            conf_changes,
        }
    }

    pub async fn handle(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let method = match *request.method() {
            Method::PUT => "PUT",
            Method::GET => "GET",
            Method::POST => "POST",
            Method::DELETE => "DELETE",
            _ => "OTHER",
        };
        record_metrics(method, || self.route(request)).await
    }

    async fn route(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let key = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        match *request.method() {
            Method::PUT => {
                let value = match hyper::body::to_bytes(request.into_body()).await {
                    Ok(body) => String::from_utf8(body.to_vec()).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let value = match value {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("Failed to read on PUT ({})", e);
                        return Ok(error(StatusCode::BAD_REQUEST, "Failed on PUT"));
                    }
                };
                // Optimistic: the value is not committed yet, so a GET right
                // after may still return the old one.
                Ok(self.propose(&key, &value, Operation::Set).await)
            }
            Method::GET => match self.store.lookup(&key) {
                Some(value) => Ok(Response::new(Body::from(value))),
                None => Ok(error(StatusCode::NOT_FOUND, "Failed to GET")),
            },
            Method::POST => {
                let context = match hyper::body::to_bytes(request.into_body()).await {
                    Ok(body) => body,
                    Err(e) => {
                        log::warn!("Failed to read on POST ({})", e);
                        return Ok(error(StatusCode::BAD_REQUEST, "Failed on POST"));
                    }
                };
                let node_id = match parse_node_id(&key[1..]) {
                    Some(id) => id,
                    None => {
                        log::warn!("Failed to convert ID for conf change ({})", &key[1..]);
                        return Ok(error(StatusCode::BAD_REQUEST, "Failed on POST"));
                    }
                };

                let mut cc = ConfChange::default();
                cc.node_id = node_id;
                cc.set_change_type(ConfChangeType::AddNode);
                cc.context = context.to_vec().into();
                if self.conf_changes.send(cc).await.is_err() {
                    log::error!("conf change sink closed");
                    return Ok(error(StatusCode::SERVICE_UNAVAILABLE, "Failed on POST"));
                }
                // As above, optimistic that raft will apply the conf change
                Ok(status(StatusCode::NO_CONTENT))
            }
            Method::DELETE => Ok(self.propose(&key, "", Operation::Delete).await),
            _ => {
                let mut response = error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
                for allowed in ALLOWED_METHODS {
                    response
                        .headers_mut()
                        .append(ALLOW, HeaderValue::from_static(allowed));
                }
                Ok(response)
            }
        }
    }

    async fn propose(&self, key: &str, value: &str, op: Operation) -> Response<Body> {
        match self.store.propose(key, value, op).await {
            Ok(()) => status(StatusCode::NO_CONTENT),
            Err(e) => {
                log::error!("Failed to propose {} {} ({})", op.as_str(), key, e);
                error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to propose")
            }
        }
    }
}

/// Binds the key-value API and serves it on a background task until
/// `shutdown` resolves.
pub fn bind<F>(
    addr: SocketAddr,
    api: Arc<HttpKvApi>,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<()>), hyper::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_| {
        let api = api.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request: Request<Body>| {
                let api = api.clone();
                async move { api.handle(request).await }
            }))
        }
    });
    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.with_graceful_shutdown(shutdown).await {
            log::error!("http api failed: {}", e);
        }
    });
    log::info!("http api started on {}", local_addr);
    Ok((local_addr, handle))
}

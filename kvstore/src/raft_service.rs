//! Raft transport endpoint
//!
//! Peers post protobuf-encoded raft messages to `POST /raft`; each decoded
//! message is handed to the local raft node's mailbox.

use std::future::Future;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

pub const RAFT_PATH: &str = "/raft";

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

#[derive(Debug, Clone)]
pub struct RaftServiceSVC {
    in_mailbox: Sender<RaftMessage>,
}

impl RaftServiceSVC {
    pub fn new(in_mailbox: Sender<RaftMessage>) -> Self {
        RaftServiceSVC { in_mailbox }
    }

    pub async fn post_data(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        if request.method() != Method::POST || request.uri().path() != RAFT_PATH {
            return Ok(status(StatusCode::NOT_FOUND));
        }

        let data = hyper::body::to_bytes(request.into_body()).await?;
        let message = match RaftMessage::parse_from_bytes(&data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("raft parse error: {}", e);
                return Ok(status(StatusCode::BAD_REQUEST));
            }
        };
        match self.in_mailbox.send(message).await {
            Ok(_) => Ok(status(StatusCode::NO_CONTENT)),
            Err(e) => {
                log::warn!("raft send error: {}", e);
                Ok(status(StatusCode::SERVICE_UNAVAILABLE))
            }
        }
    }
}

/// Binds the transport endpoint and serves it on a background task until
/// `shutdown` resolves.
pub fn bind<F>(
    addr: SocketAddr,
    svc: RaftServiceSVC,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<()>), hyper::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_| {
        let svc = svc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request: Request<Body>| {
                let svc = svc.clone();
                async move { svc.post_data(request).await }
            }))
        }
    });
    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.with_graceful_shutdown(shutdown).await {
            log::error!("raft transport failed: {}", e);
        }
    });
    log::info!("raft transport started on {}", local_addr);
    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;
    use tokio::sync::mpsc;

    fn post(path: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_post_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let svc = RaftServiceSVC::new(tx);

        let mut message = RaftMessage::default();
        message.set_msg_type(MessageType::MsgHeartbeat);
        message.to = 2;
        message.from = 1;
        let response = svc
            .post_data(post(RAFT_PATH, message.write_to_bytes().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.to, 2);
        assert_eq!(received.get_msg_type(), MessageType::MsgHeartbeat);
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (tx, rx) = mpsc::channel(4);
        let svc = RaftServiceSVC::new(tx);

        let response = svc.post_data(post("/other", vec![])).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = svc
            .post_data(post(RAFT_PATH, vec![0xff, 0xff, 0xff]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        drop(rx);
        let response = svc
            .post_data(post(RAFT_PATH, RaftMessage::default().write_to_bytes().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! The broker gRPC surface.
//!
//! [`BrokerService`] implements the three streaming RPCs over a [`Router`]:
//!
//! - `Read` resolves without a primary requirement and either serves from
//!   the local replica or transparently proxies the stream from a peer.
//! - `Append` resolves requiring the primary, retrying stale routes behind
//!   the revision barrier, and either coordinates locally or mirrors the
//!   stream to the primary.
//! - `Replicate` waits for the request's route revision, then dispatches to
//!   the local replicate handler; it is never proxied.
//!
//! Requests are validated on entry; validation failures surface as
//! `InvalidArgument` transport errors rather than status responses.

use std::{pin::Pin, sync::Arc};

use tidelog_proto::proto::{self, broker_client::BrokerClient, broker_server::Broker};
use tidelog_types::{BrokerId, Journal};
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

use crate::{
    append::{self, AppendError},
    read, replicate,
    router::Router,
    store::{JournalStore, MemoryStore},
};

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// gRPC service adapter over a [`Router`].
pub struct BrokerService<S: JournalStore = MemoryStore> {
    router: Arc<Router<S>>,
}

impl<S: JournalStore> BrokerService<S> {
    /// Builds the service over `router`.
    pub fn new(router: Arc<Router<S>>) -> Self {
        Self { router }
    }

    /// Returns the underlying router.
    pub fn router(&self) -> &Arc<Router<S>> {
        &self.router
    }

    fn dial(&self, target: &BrokerId) -> Result<tonic::transport::Channel, Status> {
        let ks = self.router.keyspace().read();
        self.router.dialer().dial_member(&ks, target).map_err(Status::from)
    }

    async fn proxy_append(
        &self,
        first: proto::AppendRequest,
        mut frames: Streaming<proto::AppendRequest>,
        target: &BrokerId,
    ) -> Result<proto::AppendResponse, Status> {
        let mut client = BrokerClient::new(self.dial(target)?);

        let (tx, rx) = mpsc::channel(8);
        let forward = async move {
            if tx.send(first).await.is_err() {
                return;
            }
            loop {
                match frames.message().await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    },
                    // Half-close, or a client error which terminates the
                    // mirrored stream.
                    Ok(None) | Err(_) => return,
                }
            }
        };

        let (response, ()) = tokio::join!(client.append(ReceiverStream::new(rx)), forward);
        Ok(response?.into_inner())
    }
}

impl<S: JournalStore> Clone for BrokerService<S> {
    fn clone(&self) -> Self {
        Self { router: Arc::clone(&self.router) }
    }
}

fn parse_journal(raw: &str) -> Result<Journal, Status> {
    Journal::new(raw).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn validate_read(req: &proto::ReadRequest) -> Result<(), Status> {
    if req.offset < -1 {
        return Err(Status::invalid_argument("read offset must be >= -1"));
    }
    Ok(())
}

fn validate_append_metadata(req: &proto::AppendRequest) -> Result<(), Status> {
    if !req.content.is_empty() {
        return Err(Status::invalid_argument(
            "append metadata frame must not carry content",
        ));
    }
    Ok(())
}

#[tonic::async_trait]
impl<S: JournalStore> Broker for BrokerService<S> {
    type ReadStream = BoxStream<proto::ReadResponse>;
    type ReplicateStream = BoxStream<proto::ReplicateResponse>;

    async fn read(
        &self,
        request: Request<proto::ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let req = request.into_inner();
        validate_read(&req)?;
        let journal = parse_journal(&req.journal)?;

        let (res, status) = self.router.resolve(&journal, false, !req.do_not_proxy);
        if status != proto::Status::Ok {
            let response = proto::ReadResponse {
                status: status.into(),
                route: Some(res.route.to_proto()),
                ..Default::default()
            };
            let stream: Self::ReadStream = Box::pin(tokio_stream::once(Ok(response)));
            return Ok(Response::new(stream));
        }

        if let Some(replica) = res.replica {
            let stream: Self::ReadStream = Box::pin(read::serve_read(replica, req));
            return Ok(Response::new(stream));
        }

        // Proxy the stream from the chosen peer until end-of-stream.
        let mut client = BrokerClient::new(self.dial(&res.target)?);
        let peer_stream = client.read(req).await?.into_inner();
        Ok(Response::new(Box::pin(peer_stream) as Self::ReadStream))
    }

    async fn append(
        &self,
        request: Request<Streaming<proto::AppendRequest>>,
    ) -> Result<Response<proto::AppendResponse>, Status> {
        let mut frames = request.into_inner();
        let Some(first) = frames.message().await? else {
            return Err(Status::invalid_argument("expected an append metadata frame"));
        };
        validate_append_metadata(&first)?;
        let journal = parse_journal(&first.journal)?;

        let mut barrier = 0_i64;
        loop {
            // If a peer told us of a future and non-equivalent route
            // revision, wait for that revision before attempting again.
            self.router.wait_for_revision(barrier).await?;

            let (res, status) = self.router.resolve(&journal, true, true);
            if status != proto::Status::Ok {
                return Ok(Response::new(proto::AppendResponse {
                    status: status.into(),
                    route: Some(res.route.to_proto()),
                    ..Default::default()
                }));
            }
            let Some(replica) = res.replica else {
                let response = self.proxy_append(first, frames, &res.target).await?;
                return Ok(Response::new(response));
            };

            replica.wait_initial_load().await?;

            match append::acquire_txn(self.router.id(), &replica, self.router.dialer()).await {
                Ok(txn) => {
                    let response = append::coordinate(txn, frames, &replica).await?;
                    return Ok(Response::new(response));
                },
                // Caught internally: wait out the cited revision, then retry.
                Err(AppendError::WrongRouteRevision { revision, .. }) => {
                    barrier = revision;
                },
                Err(AppendError::Replication { .. }) => {
                    return Ok(Response::new(proto::AppendResponse {
                        status: proto::Status::ReplicationFailed.into(),
                        route: Some(replica.route().to_proto()),
                        ..Default::default()
                    }));
                },
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn replicate(
        &self,
        request: Request<Streaming<proto::ReplicateRequest>>,
    ) -> Result<Response<Self::ReplicateStream>, Status> {
        let frames = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(replicate::run_replicate(Arc::clone(&self.router), frames, tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::ReplicateStream))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_read_validation() {
        let mut req = proto::ReadRequest { journal: "a/b".into(), ..Default::default() };
        assert!(validate_read(&req).is_ok());
        req.offset = -1;
        assert!(validate_read(&req).is_ok());
        req.offset = -2;
        assert!(validate_read(&req).is_err());
    }

    #[test]
    fn test_append_metadata_validation() {
        let mut req = proto::AppendRequest { journal: "a/b".into(), content: Vec::new() };
        assert!(validate_append_metadata(&req).is_ok());
        req.content = b"early".to_vec();
        assert!(validate_append_metadata(&req).is_err());
    }

    #[test]
    fn test_journal_parse_rejections() {
        assert!(parse_journal("ok/name").is_ok());
        for bad in ["", "/lead", "a//b"] {
            let err = parse_journal(bad).unwrap_err();
            assert_eq!(err.code(), tonic::Code::InvalidArgument);
        }
    }
}

//! Append coordination.
//!
//! The journal primary serialises appends through a per-replica transaction:
//! at most one transaction is in flight per journal. A transaction opens a
//! `Replicate` stream to every peer of the route, synchronises on the route
//! revision, fans client content out to the peers and the local store in
//! client-send order, and commits on quorum acknowledgement.
//!
//! A peer citing a higher route revision aborts acquisition; the router
//! waits for that revision before retrying, preventing retry storms against
//! a still-stale view.
//!
//! Transaction states: Idle -> Starting -> Streaming -> Committing ->
//! {Committed | Aborted}.

use std::sync::Arc;

use snafu::Snafu;
use tidelog_proto::proto;
use tidelog_types::{BrokerId, Journal};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tracing::{debug, warn};

use crate::{dialer::PeerDialer, replica::Replica, route::Route, store::JournalStore};

/// Capacity of the per-peer outbound frame queue.
const PEER_QUEUE_DEPTH: usize = 8;

/// Errors raised on the append coordination path.
///
/// `WrongRouteRevision` is caught by the router's append retry loop and
/// `Replication` surfaces to the client as a `REPLICATION_FAILED` status;
/// the rest convert to `tonic::Status` at the service boundary.
// Snafu generates fields for context selectors
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppendError {
    /// The replica set could not be synchronised, or a peer was lost
    /// mid-transaction.
    #[snafu(display("Replication of journal {journal} failed"))]
    Replication { journal: Journal },

    /// A peer cited a future route revision; the append retries once the
    /// local keyspace reaches it.
    #[snafu(display("Journal {journal} routes at revision {revision}"))]
    WrongRouteRevision { journal: Journal, revision: i64 },

    /// The journal replica was cancelled while the operation was in flight.
    #[snafu(display("Journal replica {journal} cancelled"))]
    Cancelled { journal: Journal },

    /// The journal store rejected a staged transaction.
    #[snafu(display("Journal store of {journal} failed: {message}"))]
    Store { journal: Journal, message: String },
}

impl From<AppendError> for tonic::Status {
    fn from(err: AppendError) -> Self {
        match &err {
            AppendError::Replication { .. } => tonic::Status::aborted(err.to_string()),
            AppendError::WrongRouteRevision { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            },
            AppendError::Cancelled { .. } => tonic::Status::unavailable(err.to_string()),
            AppendError::Store { .. } => tonic::Status::internal(err.to_string()),
        }
    }
}

/// Lifecycle of an append transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Starting,
    Streaming,
    Committing,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct PeerStream {
    id: BrokerId,
    tx: mpsc::Sender<proto::ReplicateRequest>,
    rx: tonic::Streaming<proto::ReplicateResponse>,
}

/// An append transaction bound to a route, holding the journal's single
/// append permit for its lifetime.
#[derive(Debug)]
pub(crate) struct Transaction<S: JournalStore> {
    _permit: OwnedSemaphorePermit,
    store: Arc<S>,
    route: Route,
    peers: Vec<PeerStream>,
    first_offset: i64,
    state: TxnState,
}

impl<S: JournalStore> Transaction<S> {
    fn abort(&mut self) {
        self.state = TxnState::Aborted;
        self.store.abort();
        // Dropping peer senders half-closes the replicate streams without a
        // commit frame; peers discard their staged content.
        self.peers.clear();
    }

    /// Fans a content chunk out to every peer, preserving send order.
    async fn replicate_chunk(&self, content: &[u8]) -> bool {
        let sends = self.peers.iter().map(|peer| {
            peer.tx.send(proto::ReplicateRequest {
                content: content.to_vec(),
                ..Default::default()
            })
        });
        futures::future::join_all(sends).await.iter().all(Result::is_ok)
    }

    /// Issues the commit frame and collects every peer's acknowledgement.
    async fn commit_peers(&mut self) -> bool {
        let commit = proto::ReplicateRequest { commit: true, ..Default::default() };
        for peer in &self.peers {
            if peer.tx.send(commit.clone()).await.is_err() {
                warn!(peer = %peer.id, "Peer replicate stream closed before commit");
                return false;
            }
        }
        for peer in &mut self.peers {
            match peer.rx.message().await {
                Ok(Some(response)) if response.status() == proto::Status::Ok => {},
                Ok(Some(response)) => {
                    warn!(peer = %peer.id, status = ?response.status(), "Peer rejected commit");
                    return false;
                },
                Ok(None) | Err(_) => {
                    warn!(peer = %peer.id, "Peer disconnected during commit");
                    return false;
                },
            }
        }
        true
    }
}

impl<S: JournalStore> Drop for Transaction<S> {
    fn drop(&mut self) {
        // A transaction dropped mid-flight (client disconnect, cancellation)
        // discards its staged content. The append permit releases with it.
        if self.state != TxnState::Committed && self.state != TxnState::Aborted {
            self.store.abort();
        }
    }
}

/// Starts an append transaction against `replica`, synchronising a
/// `Replicate` stream with every peer of the current route.
///
/// Fails with [`AppendError::WrongRouteRevision`] when a peer cites a
/// future revision, and with [`AppendError::Replication`] when the replica
/// set cannot be synchronised.
pub(crate) async fn acquire_txn<S: JournalStore>(
    self_id: &BrokerId,
    replica: &Replica<S>,
    dialer: &PeerDialer,
) -> Result<Transaction<S>, AppendError> {
    // The per-replica serialisation slot. Suspends behind an in-flight
    // transaction; cancellation of the replica unblocks the wait.
    let permit = tokio::select! {
        _ = replica.cancel_token().cancelled() => {
            return Err(AppendError::Cancelled { journal: replica.journal().clone() });
        },
        permit = Arc::clone(&replica.core.append_permit).acquire_owned() => {
            permit
                .map_err(|_| AppendError::Cancelled { journal: replica.journal().clone() })?
        },
    };

    let route = replica.route().clone();
    let store = Arc::clone(replica.store());
    let first_offset = store.begin_append();

    let mut txn = Transaction {
        _permit: permit,
        store,
        route: route.clone(),
        peers: Vec::new(),
        first_offset,
        state: TxnState::Starting,
    };

    let mut wire_route = route.to_proto();
    wire_route.endpoints.clear();
    let sync_frame = proto::ReplicateRequest {
        journal: replica.journal().to_string(),
        route: Some(wire_route),
        next_offset: first_offset,
        content: Vec::new(),
        commit: false,
    };

    for id in &route.brokers {
        if id == self_id {
            continue;
        }
        let channel = match dialer.dial_route(id, &route) {
            Ok(channel) => channel,
            Err(error) => {
                warn!(peer = %id, %error, "Failed to dial replication peer");
                txn.abort();
                return Err(AppendError::Replication { journal: replica.journal().clone() });
            },
        };
        let mut client = proto::broker_client::BrokerClient::new(channel);

        let (tx, out_rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        // Queue the synchronization frame ahead of opening the stream.
        let _ = tx.send(sync_frame.clone()).await;

        let mut rx = match client.replicate(ReceiverStream::new(out_rx)).await {
            Ok(response) => response.into_inner(),
            Err(error) => {
                warn!(peer = %id, %error, "Failed to open replicate stream");
                txn.abort();
                return Err(AppendError::Replication { journal: replica.journal().clone() });
            },
        };

        // Block until the peer acknowledges, or reports a route mismatch.
        let first = match rx.message().await {
            Ok(Some(first)) => first,
            Ok(None) | Err(_) => {
                warn!(peer = %id, "Replicate stream ended before synchronization");
                txn.abort();
                return Err(AppendError::Replication { journal: replica.journal().clone() });
            },
        };
        match first.status() {
            proto::Status::Ok => {
                txn.peers.push(PeerStream { id: id.clone(), tx, rx });
            },
            proto::Status::WrongRouteRevision => {
                let peer_revision =
                    first.route.as_ref().map(|r| r.revision).unwrap_or_default();
                txn.abort();
                if peer_revision > route.revision {
                    debug!(
                        peer = %id,
                        peer_revision,
                        local_revision = route.revision,
                        "Peer cited a future route revision"
                    );
                    return Err(AppendError::WrongRouteRevision {
                        journal: replica.journal().clone(),
                        revision: peer_revision,
                    });
                }
                return Err(AppendError::Replication { journal: replica.journal().clone() });
            },
            status => {
                warn!(peer = %id, ?status, "Peer refused replicate synchronization");
                txn.abort();
                return Err(AppendError::Replication { journal: replica.journal().clone() });
            },
        }
    }

    Ok(txn)
}

/// Coordinates a synchronised transaction: streams client content to every
/// peer and the local store, then commits on client half-close.
pub(crate) async fn coordinate<S, In>(
    mut txn: Transaction<S>,
    mut frames: In,
    replica: &Replica<S>,
) -> Result<proto::AppendResponse, tonic::Status>
where
    S: JournalStore,
    In: Stream<Item = Result<proto::AppendRequest, tonic::Status>> + Unpin,
{
    txn.state = TxnState::Streaming;

    loop {
        let next = tokio::select! {
            _ = replica.cancel_token().cancelled() => {
                txn.abort();
                return Err(
                    AppendError::Cancelled { journal: replica.journal().clone() }.into()
                );
            },
            next = frames.next() => next,
        };

        match next {
            // Client half-close: all content is in.
            None => break,
            Some(Err(status)) => {
                txn.abort();
                return Err(status);
            },
            Some(Ok(frame)) => {
                if !frame.journal.is_empty() && frame.journal != replica.journal().as_str() {
                    txn.abort();
                    return Err(tonic::Status::invalid_argument(
                        "append content frame names a different journal",
                    ));
                }
                if frame.content.is_empty() {
                    continue;
                }
                // Local staging and peer fan-out carry chunks in client-send
                // order.
                txn.store.stage(&frame.content);
                if !txn.replicate_chunk(&frame.content).await {
                    txn.abort();
                    return Ok(replication_failed(&txn.route));
                }
            },
        }
    }

    txn.state = TxnState::Committing;
    if !txn.commit_peers().await {
        txn.abort();
        return Ok(replication_failed(&txn.route));
    }

    let outcome = txn.store.commit();
    txn.state = TxnState::Committed;

    Ok(proto::AppendResponse {
        status: proto::Status::Ok.into(),
        route: Some(txn.route.to_proto()),
        first_offset: txn.first_offset,
        last_offset: outcome.last_offset,
        write_head: outcome.write_head,
    })
}

fn replication_failed(route: &Route) -> proto::AppendResponse {
    proto::AppendResponse {
        status: proto::Status::ReplicationFailed.into(),
        route: Some(route.to_proto()),
        ..Default::default()
    }
}

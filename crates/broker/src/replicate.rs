//! Secondary-side replication handler.
//!
//! A journal primary opens a `Replicate` stream for each append transaction.
//! The secondary validates the synchronization frame against its own route,
//! acknowledges, stages streamed content, and commits on the commit frame.
//! A non-equivalent route answers `WRONG_ROUTE_REVISION` with the local
//! route, directing the primary to wait out the revision gap.
//!
//! The secondary does not proactively advertise its route after a commit;
//! convergence is driven by the primary's zero-byte nudge.

use std::sync::Arc;

use tidelog_proto::proto;
use tidelog_types::Journal;
use tokio::sync::mpsc;
use tonic::Streaming;
use tracing::warn;

use crate::{append::AppendError, route::Route, router::Router, store::JournalStore};

type ResponseTx = mpsc::Sender<Result<proto::ReplicateResponse, tonic::Status>>;

/// Runs the replicate handler, writing responses into `tx`.
pub(crate) async fn run_replicate<S: JournalStore>(
    router: Arc<Router<S>>,
    mut frames: Streaming<proto::ReplicateRequest>,
    tx: ResponseTx,
) {
    if let Err(status) = replicate_inner(router, &mut frames, &tx).await {
        let _ = tx.send(Err(status)).await;
    }
}

async fn replicate_inner<S: JournalStore>(
    router: Arc<Router<S>>,
    frames: &mut Streaming<proto::ReplicateRequest>,
    tx: &ResponseTx,
) -> Result<(), tonic::Status> {
    let Some(first) = frames.message().await? else {
        return Err(tonic::Status::invalid_argument(
            "expected a replicate synchronization frame",
        ));
    };
    let journal = Journal::new(first.journal.clone())
        .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
    let Some(wire_route) = &first.route else {
        return Err(tonic::Status::invalid_argument(
            "synchronization frame is missing a route",
        ));
    };
    if first.commit {
        return Err(tonic::Status::invalid_argument(
            "synchronization frame must not carry a commit",
        ));
    }
    let req_route = Route::from_proto(wire_route)
        .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;

    // Wait for the keyspace to reach the route revision named by the
    // request, so a replicate is never accepted against a stale local route.
    router.wait_for_revision(req_route.revision).await?;

    let (res, status) = router.resolve(&journal, false, false);
    if status != proto::Status::Ok {
        let mut route = res.route.to_proto();
        route.endpoints.clear();
        let _ = tx
            .send(Ok(proto::ReplicateResponse {
                status: status.into(),
                route: Some(route),
                write_head: 0,
            }))
            .await;
        return Ok(());
    }
    let Some(replica) = res.replica else {
        return Err(tonic::Status::internal("resolution did not yield a local replica"));
    };
    replica.wait_initial_load().await?;

    if !replica.route().equivalent(&req_route) {
        // Answer with the local route; its revision tells the primary how
        // long to wait before retrying.
        let mut route = replica.route().to_proto();
        route.endpoints.clear();
        let _ = tx
            .send(Ok(proto::ReplicateResponse {
                status: proto::Status::WrongRouteRevision.into(),
                route: Some(route),
                write_head: replica.store().write_head(),
            }))
            .await;
        return Ok(());
    }

    let store = Arc::clone(replica.store());
    if first.next_offset != store.write_head() {
        warn!(
            journal = %journal,
            next_offset = first.next_offset,
            write_head = store.write_head(),
            "Replicate offset does not match the local write head"
        );
    }
    store.begin_append();

    // Acknowledge synchronization; the primary begins streaming content.
    if tx
        .send(Ok(proto::ReplicateResponse {
            status: proto::Status::Ok.into(),
            route: None,
            write_head: store.write_head(),
        }))
        .await
        .is_err()
    {
        store.abort();
        return Ok(());
    }

    loop {
        let frame = tokio::select! {
            _ = replica.cancel_token().cancelled() => {
                store.abort();
                return Err(AppendError::Cancelled { journal: journal.clone() }.into());
            },
            frame = frames.message() => match frame {
                Ok(frame) => frame,
                Err(status) => {
                    store.abort();
                    return Err(status);
                },
            },
        };

        match frame {
            // The primary went away without committing; discard staging.
            None => {
                store.abort();
                return Ok(());
            },
            Some(frame) if frame.commit => {
                let outcome = store.commit();
                let _ = tx
                    .send(Ok(proto::ReplicateResponse {
                        status: proto::Status::Ok.into(),
                        route: None,
                        write_head: outcome.write_head,
                    }))
                    .await;
                return Ok(());
            },
            Some(frame) => {
                if !frame.content.is_empty() {
                    store.stage(&frame.content);
                }
            },
        }
    }
}

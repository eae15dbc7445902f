//! Local journal read path.
//!
//! Serves a read as a stream of responses: a metadata frame naming the
//! covering fragment, followed by its content in chunks, repeating across
//! fragments until the write head. Blocking reads suspend on the index's
//! write-head watch; non-blocking reads at the head report
//! `OFFSET_NOT_YET_AVAILABLE`.

use std::sync::Arc;

use tidelog_proto::proto;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{index::IndexQuery, replica::Replica, store::JournalStore};

/// Size of streamed content chunks.
const READ_CHUNK_SIZE: usize = 1 << 16;

/// Serves a local read against `replica`, returning the response stream.
pub(crate) fn serve_read<S: JournalStore>(
    replica: Arc<Replica<S>>,
    req: proto::ReadRequest,
) -> ReceiverStream<Result<proto::ReadResponse, tonic::Status>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run_read(replica, req, tx));
    ReceiverStream::new(rx)
}

async fn run_read<S: JournalStore>(
    replica: Arc<Replica<S>>,
    req: proto::ReadRequest,
    tx: mpsc::Sender<Result<proto::ReadResponse, tonic::Status>>,
) {
    if let Err(status) = replica.wait_initial_load().await {
        let _ = tx.send(Err(status)).await;
        return;
    }

    let index = Arc::clone(replica.index());
    let store = Arc::clone(replica.store());
    let route = replica.route().to_proto();
    let mut head_rx = index.head_rx();

    let mut offset = if req.offset < 0 { index.write_head() } else { req.offset };

    loop {
        match index.query(offset) {
            IndexQuery::Found(fragment) => {
                // Offsets falling into a fragment gap adjust forward.
                offset = offset.max(fragment.begin);

                let metadata = proto::ReadResponse {
                    status: proto::Status::Ok.into(),
                    route: Some(route.clone()),
                    offset,
                    write_head: index.write_head(),
                    fragment: Some(fragment.to_proto()),
                    fragment_url: String::new(),
                    content: Vec::new(),
                };
                if tx.send(Ok(metadata)).await.is_err() {
                    return;
                }
                if req.metadata_only {
                    return;
                }

                while offset < fragment.end {
                    let max = READ_CHUNK_SIZE.min((fragment.end - offset) as usize);
                    let chunk = store.read_at(offset, max);
                    if chunk.is_empty() {
                        break;
                    }
                    let len = chunk.len() as i64;
                    let content = proto::ReadResponse {
                        status: proto::Status::Ok.into(),
                        offset,
                        content: chunk.to_vec(),
                        ..Default::default()
                    };
                    if tx.send(Ok(content)).await.is_err() {
                        return;
                    }
                    offset += len;
                }
            },
            IndexQuery::BeyondHead => {
                if !req.block {
                    let response = proto::ReadResponse {
                        status: proto::Status::OffsetNotYetAvailable.into(),
                        route: Some(route.clone()),
                        offset,
                        write_head: index.write_head(),
                        ..Default::default()
                    };
                    let _ = tx.send(Ok(response)).await;
                    return;
                }
                // Suspend until a commit advances the head past |offset|.
                tokio::select! {
                    _ = replica.cancel_token().cancelled() => {
                        let _ = tx
                            .send(Err(tonic::Status::unavailable(format!(
                                "journal replica {} cancelled",
                                replica.journal()
                            ))))
                            .await;
                        return;
                    },
                    res = async { head_rx.wait_for(|h| *h > offset).await.map(|_| ()) } => {
                        if res.is_err() {
                            return;
                        }
                    },
                }
            },
        }

        // Non-blocking reads end once they reach the write head.
        if !req.block && offset >= index.write_head() {
            return;
        }
    }
}

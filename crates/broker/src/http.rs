//! HTTP gateway.
//!
//! A thin translator from HTTP to the native RPC surface:
//!
//! - `GET /<journal>?offset=<int>&block=<bool>` streams a read; `HEAD`
//!   returns fragment metadata only.
//! - `PUT /<journal>` appends the request body as the content stream.
//!
//! The gateway resolves the journal, then dials the resolved broker through
//! the peer cache (the loopback connection included), keeping one uniform
//! code path for local and remote targets. Unknown query parameters are
//! rejected.

use std::{pin::pin, sync::Arc};

use axum::{
    body::Body,
    extract::{Query, Request, State},
    response::{IntoResponse, Response},
    routing::any,
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use tidelog_proto::proto::{self, broker_client::BrokerClient};
use tidelog_types::Journal;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use crate::{
    route::Route,
    router::Router,
    store::{JournalStore, MemoryStore},
};

/// Route under which a response was served.
pub const ROUTE_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-route-token");
/// Content-addressed name of the fragment covering the read offset.
pub const FRAGMENT_NAME_HEADER: HeaderName = HeaderName::from_static("x-fragment-name");
/// Modification time of the covering fragment.
pub const FRAGMENT_LAST_MODIFIED_HEADER: HeaderName =
    HeaderName::from_static("x-fragment-last-modified");
/// Direct fetch location of the covering fragment, if remote.
pub const FRAGMENT_LOCATION_HEADER: HeaderName = HeaderName::from_static("x-fragment-location");
/// The journal write head observed by the serving broker.
pub const WRITE_HEAD_HEADER: HeaderName = HeaderName::from_static("x-write-head");
/// First byte offset of an appended span.
pub const FIRST_OFFSET_HEADER: HeaderName = HeaderName::from_static("x-first-offset");
/// Exclusive end offset of an appended span.
pub const LAST_OFFSET_HEADER: HeaderName = HeaderName::from_static("x-last-offset");

/// Shared state of the gateway handlers.
pub struct Gateway<S: JournalStore = MemoryStore> {
    router: Arc<Router<S>>,
}

impl<S: JournalStore> Clone for Gateway<S> {
    fn clone(&self) -> Self {
        Self { router: Arc::clone(&self.router) }
    }
}

/// Builds the gateway router over a broker [`Router`].
pub fn gateway<S: JournalStore>(router: Arc<Router<S>>) -> axum::Router {
    axum::Router::new()
        .route("/{*journal}", any(serve::<S>))
        .with_state(Gateway { router })
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    block: bool,
}

async fn serve<S: JournalStore>(State(gw): State<Gateway<S>>, request: Request) -> Response {
    let method = request.method().clone();
    if method == Method::GET || method == Method::HEAD {
        serve_read(gw, request).await
    } else if method == Method::PUT {
        serve_write(gw, request).await
    } else {
        (StatusCode::BAD_REQUEST, format!("unknown method: {method}")).into_response()
    }
}

fn parse_journal(request: &Request) -> Result<(Journal, String), Response> {
    let raw = request.uri().path().trim_start_matches('/').to_string();
    match Journal::new(raw.clone()) {
        Ok(journal) => Ok((journal, raw)),
        Err(error) => Err((StatusCode::BAD_REQUEST, error.to_string()).into_response()),
    }
}

async fn serve_read<S: JournalStore>(gw: Gateway<S>, request: Request) -> Response {
    let query = match Query::<ReadQuery>::try_from_uri(request.uri()) {
        Ok(Query(query)) => query,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, rejection.to_string()).into_response();
        },
    };
    let (journal, raw_journal) = match parse_journal(&request) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let metadata_only = request.method() == Method::HEAD;

    let req = proto::ReadRequest {
        journal: raw_journal,
        offset: query.offset,
        block: query.block,
        do_not_proxy: false,
        metadata_only,
    };

    let (res, status) = gw.router.resolve(&journal, false, true);
    if status != proto::Status::Ok {
        let response = proto::ReadResponse {
            status: status.into(),
            route: Some(res.route.to_proto()),
            ..Default::default()
        };
        return read_response_head(&response, Body::from(status.as_str_name()));
    }

    // Dial the resolved broker, which may be this process itself: the
    // loopback connection keeps the code path uniform.
    let channel = {
        let ks = gw.router.keyspace().read();
        gw.router.dialer().dial_member(&ks, &res.target)
    };
    let channel = match channel {
        Ok(channel) => channel,
        Err(error) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response();
        },
    };

    let mut client = BrokerClient::new(channel);
    let mut stream = match client.read(req).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, status.to_string()).into_response();
        },
    };
    let first = match stream.message().await {
        Ok(Some(first)) => first,
        Ok(None) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "empty read response stream")
                .into_response();
        },
        Err(status) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, status.to_string()).into_response();
        },
    };

    if first.status() != proto::Status::Ok {
        return read_response_head(&first, Body::from(first.status().as_str_name()));
    }
    if metadata_only {
        return read_response_head(&first, Body::empty());
    }

    // Forward content frames as the response body until end-of-stream.
    let content = stream.map(|item| match item {
        Ok(response) => Ok(Bytes::from(response.content)),
        Err(status) => Err(axum::Error::new(status)),
    });
    read_response_head(&first, Body::from_stream(content))
}

async fn serve_write<S: JournalStore>(gw: Gateway<S>, request: Request) -> Response {
    if request.uri().query().is_some_and(|q| !q.is_empty()) {
        return (StatusCode::BAD_REQUEST, "unexpected query parameters").into_response();
    }
    let (journal, raw_journal) = match parse_journal(&request) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    let (res, status) = gw.router.resolve(&journal, true, true);
    if status != proto::Status::Ok {
        let response = proto::AppendResponse {
            status: status.into(),
            route: Some(res.route.to_proto()),
            ..Default::default()
        };
        return append_response_head(&response);
    }

    let channel = {
        let ks = gw.router.keyspace().read();
        gw.router.dialer().dial_member(&ks, &res.target)
    };
    let channel = match channel {
        Ok(channel) => channel,
        Err(error) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response();
        },
    };
    let mut client = BrokerClient::new(channel);

    let (tx, rx) = mpsc::channel(8);
    let mut body = request.into_body().into_data_stream();
    let forward = async move {
        if tx
            .send(proto::AppendRequest { journal: raw_journal, content: Vec::new() })
            .await
            .is_err()
        {
            return Ok(());
        }
        while let Some(chunk) = body.next().await {
            let bytes = chunk?;
            if tx
                .send(proto::AppendRequest { journal: String::new(), content: bytes.to_vec() })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        Ok::<(), axum::Error>(())
    };

    let mut append_call = pin!(client.append(ReceiverStream::new(rx)));
    let mut forward = pin!(forward);
    let mut forward_done = false;
    loop {
        tokio::select! {
            response = &mut append_call => {
                return match response {
                    Ok(response) => append_response_head(&response.into_inner()),
                    Err(status) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, status.to_string()).into_response()
                    },
                };
            },
            result = &mut forward, if !forward_done => {
                match result {
                    Ok(()) => forward_done = true,
                    // Dropping the in-flight call aborts the upstream append
                    // rather than committing a truncated body.
                    Err(error) => {
                        return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
                    },
                }
            },
        }
    }
}

// ============================================================================
// Response mapping
// ============================================================================

fn route_token(route: &proto::Route) -> Option<String> {
    Route::from_proto(route).ok().map(|r| r.to_string())
}

fn http_date(unix_seconds: i64) -> Option<String> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix_seconds, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn read_status_code(status: proto::Status) -> StatusCode {
    match status {
        proto::Status::Ok => StatusCode::PARTIAL_CONTENT,
        proto::Status::JournalNotFound => StatusCode::NOT_FOUND,
        proto::Status::NoJournalBrokers => StatusCode::SERVICE_UNAVAILABLE,
        proto::Status::OffsetNotYetAvailable => StatusCode::RANGE_NOT_SATISFIABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn append_status_code(status: proto::Status) -> StatusCode {
    match status {
        proto::Status::Ok => StatusCode::NO_CONTENT,
        proto::Status::JournalNotFound => StatusCode::NOT_FOUND,
        proto::Status::ReplicationFailed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn read_response_head(response: &proto::ReadResponse, body: Body) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(route) = &response.route
        && let Some(token) = route_token(route)
    {
        insert(&mut headers, ROUTE_TOKEN_HEADER, token);
    }
    if let Some(fragment) = &response.fragment {
        let name = format!("{:016x}-{:016x}-{}", fragment.begin, fragment.end, fragment.sum);
        insert(&mut headers, FRAGMENT_NAME_HEADER, name);
        if fragment.mod_time != 0
            && let Some(date) = http_date(fragment.mod_time)
        {
            insert(&mut headers, FRAGMENT_LAST_MODIFIED_HEADER, date);
        }
        if !response.fragment_url.is_empty() {
            insert(&mut headers, FRAGMENT_LOCATION_HEADER, response.fragment_url.clone());
        }
    }
    if response.write_head != 0 {
        insert(&mut headers, WRITE_HEAD_HEADER, response.write_head.to_string());
    }
    (read_status_code(response.status()), headers, body).into_response()
}

fn append_response_head(response: &proto::AppendResponse) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(route) = &response.route
        && let Some(token) = route_token(route)
    {
        insert(&mut headers, ROUTE_TOKEN_HEADER, token);
    }
    if response.first_offset != 0 {
        insert(&mut headers, FIRST_OFFSET_HEADER, response.first_offset.to_string());
    }
    if response.last_offset != 0 {
        insert(&mut headers, LAST_OFFSET_HEADER, response.last_offset.to_string());
    }
    if response.write_head != 0 {
        insert(&mut headers, WRITE_HEAD_HEADER, response.write_head.to_string());
    }

    let code = append_status_code(response.status());
    let body = if code == StatusCode::NO_CONTENT {
        Body::empty()
    } else {
        Body::from(response.status().as_str_name())
    };
    (code, headers, body).into_response()
}

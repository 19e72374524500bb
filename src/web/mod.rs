use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::debug;

use crate::db::{BwDb, DbError};
use crate::live::{LiveConsumer, LiveFeed};
use crate::sample::{Resolution, Sample};

/// Depth of the per-subscriber live channel; samples are dropped silently
/// when a subscriber falls this far behind.
const LIVE_CHANNEL_DEPTH: usize = 8;

/// One interface as seen by the query surface.
pub struct IfaceHandle {
    /// Display name (alias when configured).
    pub name: String,
    pub db: Arc<BwDb<Sample>>,
}

/// Shared state behind the HTTP layer.
pub struct AppState {
    pub ifaces: Vec<IfaceHandle>,
    pub live: Arc<LiveFeed>,
    /// Cancelled on shutdown so live subscribers release their connections
    /// and the server can finish its graceful drain.
    pub cancel: CancellationToken,
}

/// Per-interface sample set as served by the history endpoints.
#[derive(Debug, Serialize)]
pub struct NamedSamples {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Samples")]
    pub samples: Vec<Sample>,
}

/// One live update as framed on the WebSocket feed.
#[derive(Debug, Clone, Serialize)]
pub struct NamedSample {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Data")]
    pub data: Sample,
}

/// Build the HTTP router: the JSON query surface, the live WebSocket, and
/// a static file fallback for the UI.
pub fn router(state: Arc<AppState>, web_root: &Path) -> Router {
    Router::new()
        .route("/api/interfaces", get(interfaces))
        .route("/api/minutes", get(minutes))
        .route("/api/hours", get(hours))
        .route("/api/days", get(days))
        .route("/api/months", get(months))
        .route("/api/live", get(live))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

/// Pull one bucket and sort chronologically. The engine does not order its
/// buckets; ordering is this facade's job. A bucket that was never created
/// reads as empty.
fn pull_sorted(db: &BwDb<Sample>, res: Resolution) -> Result<Vec<Sample>, DbError> {
    let mut set = match db.samples(res) {
        Ok(set) => set,
        Err(DbError::NoBucket) => Vec::new(),
        Err(e) => return Err(e),
    };
    set.sort_by_key(|s| s.ts);
    Ok(set)
}

/// Collect the sorted sample sets of every interface for one resolution.
fn collect_sets(state: &AppState, res: Resolution) -> Result<Vec<NamedSamples>, DbError> {
    let mut out = Vec::with_capacity(state.ifaces.len());
    for iface in &state.ifaces {
        out.push(NamedSamples {
            name: iface.name.clone(),
            samples: pull_sorted(&iface.db, res)?,
        });
    }
    Ok(out)
}

async fn interfaces(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.ifaces.iter().map(|i| i.name.clone()).collect())
}

async fn samples_response(state: &AppState, res: Resolution) -> impl IntoResponse {
    match collect_sets(state, res) {
        Ok(sets) => Json(sets).into_response(),
        Err(e) => {
            tracing::error!(error = %e, bucket = %res, "query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn minutes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    samples_response(&state, Resolution::Minute).await
}

async fn hours(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    samples_response(&state, Resolution::Hour).await
}

async fn days(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    samples_response(&state, Resolution::Day).await
}

async fn months(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    samples_response(&state, Resolution::Month).await
}

/// Live feed subscriber backed by a small bounded channel.
///
/// `try_send` keeps the broadcast non-blocking: a full channel drops the
/// sample silently, and only a closed channel (the socket task exited)
/// reports an error so the feed detaches us.
struct ChannelConsumer {
    tx: Option<mpsc::Sender<NamedSample>>,
}

impl LiveConsumer for ChannelConsumer {
    fn write(&mut self, name: &str, sample: &Sample) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            bail!("consumer is closed");
        };

        match tx.try_send(NamedSample {
            name: name.to_string(),
            data: *sample,
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("subscriber is gone"),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

async fn live(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_live(socket, state))
}

async fn stream_live(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::channel::<NamedSample>(LIVE_CHANNEL_DEPTH);
    let id = state.live.register(Box::new(ChannelConsumer { tx: Some(tx) }));
    debug!(id, "live subscriber registered");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,

            update = rx.recv() => {
                let Some(update) = update else { break };
                let Ok(text) = serde_json::to_string(&update) else { break };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    if let Err(e) = state.live.deregister(id) {
        debug!(id, error = %e, "deregistering live subscriber");
    }
    debug!(id, "live subscriber gone");
}

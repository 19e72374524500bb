use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::BwDb;
use crate::iface::{Iface, IfaceError};
use crate::live::LiveFeed;
use crate::sample::Sample;
use crate::web::{self, AppState, IfaceHandle};

/// Depth of the producer-to-consumer update queue. A full queue briefly
/// blocks the producer, which is the backpressure between sampling and
/// persistence.
const UPDATE_QUEUE_DEPTH: usize = 16;

/// One monitored interface: its sampler and its on-disk store.
#[derive(Clone)]
struct IfStore {
    iface: Arc<Iface>,
    db: Arc<BwDb<Sample>>,
}

/// One sampled delta on its way to the consumer.
struct Update {
    index: usize,
    sample: Sample,
}

/// How long shutdown waits for the web server to drain its connections
/// before aborting it.
const WEB_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Agent wires the samplers, stores, live feed, producer/consumer loops,
/// and the web server together.
pub struct Agent {
    cfg: Config,
    stores: Vec<IfStore>,
    live: Arc<LiveFeed>,
    cancel: CancellationToken,
    pipeline: Vec<JoinHandle<()>>,
    web_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Open every configured interface and its store, and rebase each
    /// store against the current wall clock. Store or rebase failures are
    /// fatal; an unopenable interface only logs and keeps retrying.
    pub fn new(cfg: Config) -> Result<Self> {
        std::fs::create_dir_all(&cfg.storage_location).with_context(|| {
            format!(
                "creating storage directory {}",
                cfg.storage_location.display()
            )
        })?;

        let mut stores = Vec::with_capacity(cfg.interfaces.len());
        for ic in &cfg.interfaces {
            let iface = Arc::new(Iface::new(ic.name.clone(), ic.alias.clone()));

            let db_path = cfg.storage_location.join(format!("{}.db", ic.name));
            let db = BwDb::open(&db_path, cfg.live_size)
                .with_context(|| format!("opening store {}", db_path.display()))?;

            // Residency must be restored before the producer starts.
            db.rebase(Utc::now())
                .with_context(|| format!("rebasing store {}", db_path.display()))?;

            info!(iface = %ic.name, store = %db_path.display(), "interface ready");

            stores.push(IfStore {
                iface,
                db: Arc::new(db),
            });
        }

        Ok(Self {
            cfg,
            stores,
            live: Arc::new(LiveFeed::new()),
            cancel: CancellationToken::new(),
            pipeline: Vec::new(),
            web_task: None,
        })
    }

    /// Bind the listener, start the web server, and start the sampling
    /// pipeline.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.web_server_bind_address)
            .await
            .with_context(|| format!("binding {}", self.cfg.web_server_bind_address))?;
        info!(addr = %self.cfg.web_server_bind_address, "web server listening");

        let state = Arc::new(AppState {
            ifaces: self
                .stores
                .iter()
                .map(|s| IfaceHandle {
                    name: s.iface.display_name().to_string(),
                    db: Arc::clone(&s.db),
                })
                .collect(),
            live: Arc::clone(&self.live),
            cancel: self.cancel.child_token(),
        });

        let router = web::router(state, &self.cfg.web_root);
        let web_cancel = self.cancel.child_token();
        self.web_task = Some(tokio::spawn(async move {
            let shutdown = async move { web_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "web server failed");
            }
        }));

        let (tx, rx) = mpsc::channel::<Update>(UPDATE_QUEUE_DEPTH);

        self.pipeline.push(tokio::spawn(produce_updates(
            tx,
            self.cfg.update_interval,
            self.stores.clone(),
            Arc::clone(&self.live),
            self.cancel.child_token(),
        )));

        let dbs: Vec<Arc<BwDb<Sample>>> =
            self.stores.iter().map(|s| Arc::clone(&s.db)).collect();
        self.pipeline.push(tokio::spawn(consume_updates(rx, dbs)));

        info!(
            interfaces = self.stores.len(),
            interval = ?self.cfg.update_interval,
            "agent started",
        );

        Ok(())
    }

    /// Stop the producer, let the consumer drain, close every store and
    /// sampler, then take the web listener down last.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // Cancellation stops the producer, which drops its sender; the
        // consumer drains the queue and follows. Neither depends on the
        // web server, so they are joined first.
        for task in self.pipeline.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "pipeline task join failed");
            }
        }

        for store in &self.stores {
            if let Err(e) = store.db.close() {
                error!(iface = %store.iface.name(), error = %e, "closing store");
            }
            match store.iface.close() {
                Ok(()) | Err(IfaceError::Closed) => {}
                Err(e) => error!(iface = %store.iface.name(), error = %e, "closing interface"),
            }
        }

        // Graceful drain waits for clients to hang up; a peer that never
        // does must not wedge shutdown, so the wait is bounded.
        if let Some(mut web) = self.web_task.take() {
            match tokio::time::timeout(WEB_SHUTDOWN_GRACE, &mut web).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "web server join failed"),
                Err(_) => {
                    warn!("web server did not drain in time, aborting");
                    web.abort();
                }
            }
        }

        Ok(())
    }
}

/// Producer: on every tick, poll each sampler, queue the sample for
/// persistence, and broadcast it to live subscribers. Cancellation stops
/// the ticker and drops the sender, which lets the consumer drain and exit.
async fn produce_updates(
    tx: mpsc::Sender<Update>,
    period: Duration,
    stores: Vec<IfStore>,
    live: Arc<LiveFeed>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for (index, store) in stores.iter().enumerate() {
                    let (sent, received) = store.iface.get_stats();
                    let sample = Sample::new(Utc::now(), sent, received);

                    if tx.send(Update { index, sample }).await.is_err() {
                        // Consumer is gone; nothing left to feed.
                        return;
                    }

                    live.service(store.iface.display_name(), &sample);
                }
            }
        }
    }
}

/// Consumer: drain queued samples into the per-interface engines. Engine
/// errors are logged and the loop continues; the queue closing ends it.
async fn consume_updates(mut rx: mpsc::Receiver<Update>, dbs: Vec<Arc<BwDb<Sample>>>) {
    while let Some(update) = rx.recv().await {
        let Some(db) = dbs.get(update.index) else {
            warn!(index = update.index, "update for unknown interface");
            continue;
        };

        if let Err(e) = db.add(update.sample) {
            warn!(index = update.index, error = %e, "storing sample failed");
        }
    }
}

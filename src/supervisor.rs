//! Task orchestration: owns the store, the background tasks and the HTTP
//! server, and drives cooperative shutdown with a bounded deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::catalog::AppCatalog;
use crate::clock::Clock;
use crate::config::{Config, RuntimeSettings};
use crate::health::HealthMetrics;
use crate::ingest::DomainIngest;
use crate::query::QueryEngine;
use crate::retention::{Retention, RetentionPolicy};
use crate::sampler::delta::DeltaEngine;
use crate::sampler::ProcessSampler;
use crate::server::{self, ServerState};
use crate::store::models::RawSample;
use crate::store::samples::SampleRepository;
use crate::store::settings::SettingsRepository;
use crate::store::Database;

/// Supervises the sampler task, the aggregate-then-prune scheduler and
/// the HTTP server. Handlers get a reference to this state through
/// [`ServerState`]; there is no process-wide daemon global.
pub struct Supervisor {
    db: Database,
    settings: Arc<RuntimeSettings>,
    health: Arc<HealthMetrics>,
    catalog: Arc<AppCatalog>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    http_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
}

impl Supervisor {
    /// Opens the store (creating the data directory with owner-only
    /// permissions) and merges settings-table overrides over the file
    /// configuration. Fails fast on any of those: they are fatal.
    pub async fn new(cfg: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;

        std::fs::create_dir_all(cfg.log_dir())
            .with_context(|| format!("creating log directory {}", cfg.log_dir().display()))?;

        let db = Database::open(cfg.db_path()).context("opening store")?;

        let overrides = db
            .execute(|conn| SettingsRepository::new(conn).all())
            .await
            .context("loading settings overrides")?;
        let mut cfg = cfg;
        cfg.apply_overrides(&overrides);
        let shutdown_grace = cfg.retention.shutdown_grace;

        Ok(Self {
            db: db.clone(),
            settings: Arc::new(RuntimeSettings::new(cfg)),
            health: Arc::new(HealthMetrics::new().context("creating health metrics")?),
            catalog: Arc::new(AppCatalog::new(db)),
            clock,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            http_addr: None,
            shutdown_grace,
        })
    }

    /// Starts every component. The sampler capability is injected so
    /// tests can drive synthetic snapshots through the real pipeline.
    pub async fn start<S>(&mut self, sampler: S) -> Result<()>
    where
        S: ProcessSampler + 'static,
    {
        let cfg = self.settings.snapshot();

        self.spawn_sampler(sampler, Duration::from_secs(cfg.daemon.sampling_interval_seconds));
        self.spawn_scheduler(cfg.retention.scheduler_interval);

        let state = Arc::new(ServerState {
            db: self.db.clone(),
            query: QueryEngine::new(self.db.clone(), Arc::clone(&self.settings)),
            ingest: DomainIngest::new(self.db.clone(), Arc::clone(&self.catalog)),
            health: Arc::clone(&self.health),
            settings: Arc::clone(&self.settings),
            clock: Arc::clone(&self.clock),
            config_file: Config::config_path(&cfg.data_dir),
        });
        let addr = server::serve(state, cfg.server.port, self.cancel.child_token())
            .await
            .context("starting http server")?;
        self.http_addr = Some(addr);

        info!(
            addr = %addr,
            interval = cfg.daemon.sampling_interval_seconds,
            "netmond started",
        );

        Ok(())
    }

    /// Address the HTTP server is bound to, once started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Cancels every task and waits up to the shutdown grace period.
    /// On timeout the store is closed regardless; the WAL keeps committed
    /// work durable.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        let join_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "task join failed during shutdown");
                }
            }
        };

        if tokio::time::timeout(self.shutdown_grace, join_all)
            .await
            .is_err()
        {
            warn!(
                grace = ?self.shutdown_grace,
                "shutdown deadline exceeded, closing store anyway",
            );
        }

        info!("netmond stopped");
        Ok(())
    }

    /// Periodic sampler: snapshot, diff, resolve identities, batch-insert.
    /// A tick that overruns its interval delays the next tick, it never
    /// runs concurrently with it.
    fn spawn_sampler<S>(&mut self, sampler: S, interval: Duration)
    where
        S: ProcessSampler + 'static,
    {
        let cancel = self.cancel.child_token();
        let clock = Arc::clone(&self.clock);
        let catalog = Arc::clone(&self.catalog);
        let health = Arc::clone(&self.health);
        let db = self.db.clone();

        let task = tokio::spawn(async move {
            let mut engine = DeltaEngine::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = match sampler.snapshot().await {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                health.sampler_errors.inc();
                                warn!(error = %e, "snapshot failed, skipping tick");
                                continue;
                            }
                        };

                        let ts = clock.now_secs();
                        let deltas = engine.advance(snapshot);
                        health.apps_tracked.set(engine.tracked() as f64);

                        let mut rows = Vec::with_capacity(deltas.len());
                        for delta in deltas {
                            let app_id = match catalog
                                .resolve(
                                    &delta.identity.process_name,
                                    delta.identity.bundle_id.as_deref(),
                                    ts,
                                )
                                .await
                            {
                                Ok(app_id) => app_id,
                                Err(e) => {
                                    warn!(
                                        process = %delta.identity.process_name,
                                        error = %e,
                                        "app intern failed, dropping row",
                                    );
                                    continue;
                                }
                            };
                            rows.push(RawSample {
                                ts,
                                app_id,
                                bytes_out: delta.bytes_out.0,
                                bytes_in: delta.bytes_in.0,
                                packets_out: delta.packets_out.0,
                                packets_in: delta.packets_in.0,
                                active_connections: 0,
                            });
                        }

                        if rows.is_empty() {
                            continue;
                        }

                        let written = rows.len();
                        match db
                            .execute(move |conn| SampleRepository::insert_raw_batch(conn, &rows))
                            .await
                        {
                            Ok(inserted) => {
                                health.samples_collected.inc();
                                health.rows_written.inc_by(inserted as f64);
                                if inserted < written {
                                    tracing::debug!(
                                        written,
                                        inserted,
                                        "duplicate (ts, app) rows ignored",
                                    );
                                }
                            }
                            Err(e) => {
                                health.sampler_errors.inc();
                                warn!(error = %e, "sample batch insert failed");
                            }
                        }
                    }
                }
            }
        });
        self.tasks.push(task);
    }

    /// Periodic scheduler: flush debounced last-seen updates, aggregate,
    /// then prune. The aggregate-before-prune ordering inside one tick is
    /// a hard invariant.
    fn spawn_scheduler(&mut self, interval: Duration) {
        let cancel = self.cancel.child_token();
        let clock = Arc::clone(&self.clock);
        let catalog = Arc::clone(&self.catalog);
        let health = Arc::clone(&self.health);
        let settings = Arc::clone(&self.settings);
        let aggregator = Aggregator::new(self.db.clone());
        let retention = Retention::new(self.db.clone());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let now = clock.now_secs();

                        if let Err(e) = catalog.flush_last_seen(now).await {
                            warn!(error = %e, "last-seen flush failed");
                        }

                        let aggregated = match aggregator.run(now).await {
                            Ok(_) => {
                                health.scheduler_runs.inc();
                                true
                            }
                            Err(e) => {
                                health.record_invariant_failure();
                                warn!(error = %e, "aggregation pass failed");
                                false
                            }
                        };

                        // Prune only after aggregation had its chance this
                        // tick; a failed aggregation defers deletes anyway
                        // via the per-bucket guard.
                        let cfg = settings.snapshot();
                        let policy = RetentionPolicy {
                            raw_ttl_days: cfg.retention.raw_ttl_days,
                            hour_ttl_days: cfg.retention.hour_ttl_days,
                        };
                        match retention.run(policy, now).await {
                            Ok(outcome) => {
                                health
                                    .retention_deleted
                                    .with_label_values(&["raw"])
                                    .inc_by(outcome.raw_deleted as f64);
                                health
                                    .retention_deleted
                                    .with_label_values(&["hourly"])
                                    .inc_by(outcome.hourly_deleted as f64);
                                if aggregated {
                                    health.record_unit_success();
                                }
                            }
                            Err(e) => {
                                health.record_invariant_failure();
                                warn!(error = %e, "retention pass failed");
                            }
                        }
                    }
                }
            }
        });
        self.tasks.push(task);
    }
}

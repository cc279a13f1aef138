//! Station worker lifecycle and health supervision
//!
//! Owns one worker task per monitored station. On startup every station
//! in `active` status gets a worker; a periodic probe loop HEADs each
//! stream URL, appends the outcome to health history, and flips station
//! status on three consecutive failures. Inactive stations keep being
//! probed at a quarter of the normal rhythm and come back automatically.
//!
//! External control arrives over a command channel (station add/remove
//! from the API layer). Graceful shutdown cancels all workers, waits
//! out the grace period, then aborts stragglers.

use crate::config::Settings;
use crate::db::stations::{self, Station};
use crate::error::DetectResult;
use crate::services::external_recognizer::ExternalRecognizer;
use crate::services::local_matcher::LocalMatcher;
use crate::services::play_tracker::PlayTracker;
use crate::services::station_worker::StationWorker;
use crate::services::stream_checker::{ProbeStatus, StreamChecker};
use crate::services::stream_fetcher::StreamFetcher;
use crate::services::track_resolver::TrackResolver;
use chrono::Utc;
use sodav_common::{EventBus, MonitorEvent, StationStatus};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consecutive probe failures before a station is marked inactive.
const FAILURE_THRESHOLD: i64 = 3;
/// Inactive stations are probed every Nth health tick.
const SLOW_PROBE_DIVISOR: u64 = 4;
/// Health history is pruned every Nth tick.
const PRUNE_DIVISOR: u64 = 120;
/// Health records older than this many days are pruned.
const HEALTH_RETENTION_DAYS: i64 = 7;

/// External control commands.
#[derive(Debug)]
pub enum StationCommand {
    /// Start monitoring a station already present in the store
    Add(i64),
    /// Stop monitoring and mark the station offline
    Remove(i64),
}

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervisor for the per-station worker fleet.
pub struct StationSupervisor {
    pool: SqlitePool,
    settings: Arc<Settings>,
    event_bus: EventBus,
    fetcher: StreamFetcher,
    checker: StreamChecker,
    external: Arc<ExternalRecognizer>,
    workers: HashMap<i64, WorkerHandle>,
    command_rx: mpsc::Receiver<StationCommand>,
    shutdown: CancellationToken,
}

impl StationSupervisor {
    pub fn new(
        pool: SqlitePool,
        settings: Arc<Settings>,
        event_bus: EventBus,
        external: Arc<ExternalRecognizer>,
        command_rx: mpsc::Receiver<StationCommand>,
        shutdown: CancellationToken,
    ) -> DetectResult<Self> {
        let timeout = settings.request_timeout_duration();
        let fetcher = StreamFetcher::new(settings.sample_rate, timeout)?;
        let checker = StreamChecker::new(timeout);

        Ok(Self {
            pool,
            settings,
            event_bus,
            fetcher,
            checker,
            external,
            workers: HashMap::new(),
            command_rx,
            shutdown,
        })
    }

    /// Main supervision loop. Returns after graceful shutdown completes.
    pub async fn run(mut self) -> DetectResult<()> {
        let active = stations::load_active_stations(&self.pool).await?;
        tracing::info!(count = active.len(), "starting station workers");
        for station in active {
            self.spawn_worker(&station);
        }

        let mut health_tick =
            tokio::time::interval(Duration::from_secs_f64(self.settings.healthcheck_interval));
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_count = 0u64;
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = health_tick.tick() => {
                    tick_count += 1;
                    if let Err(e) = self.run_health_checks(tick_count).await {
                        tracing::error!("health check sweep failed: {}", e);
                    }
                }
                command = self.command_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                tracing::error!("station command failed: {}", e);
                            }
                        }
                        None => {
                            tracing::debug!("command channel closed");
                            commands_open = false;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    fn spawn_worker(&mut self, station: &Station) {
        if self.workers.contains_key(&station.id) {
            return;
        }

        let cancel = self.shutdown.child_token();
        let tracker = PlayTracker::new(
            station.id,
            self.pool.clone(),
            self.event_bus.clone(),
            self.settings.same_track_similarity,
            self.settings.silence_duration,
        );
        let worker = StationWorker::new(
            station.id,
            station.name.clone(),
            station.stream_url.clone(),
            Arc::clone(&self.settings),
            self.fetcher.clone(),
            LocalMatcher::new(self.pool.clone()),
            Arc::clone(&self.external),
            TrackResolver::new(self.pool.clone()),
            tracker,
            cancel.clone(),
        );

        let name = station.name.clone();
        let bus = self.event_bus.clone();
        let station_id = station.id;
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!(station = %name, error = %e, "worker exited with error");
                bus.publish(MonitorEvent::ErrorRaised {
                    scope: format!("station:{}", station_id),
                    kind: "worker_failed".to_string(),
                    message: e.to_string(),
                });
            }
        });

        tracing::info!(station_id = station.id, name = %station.name, "worker spawned");
        self.workers.insert(station.id, WorkerHandle { cancel, handle });
    }

    async fn stop_worker(&mut self, station_id: i64) {
        if let Some(mut worker) = self.workers.remove(&station_id) {
            worker.cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(5), &mut worker.handle)
                .await
                .is_err()
            {
                tracing::warn!(station_id, "worker did not stop in time, aborting");
                worker.handle.abort();
            }
            tracing::info!(station_id, "worker stopped");
        }
    }

    /// One probe sweep. Active stations are probed every tick; inactive
    /// ones at the slow rhythm.
    async fn run_health_checks(&mut self, tick_count: u64) -> DetectResult<()> {
        let all: Vec<Station> = {
            let rows = sqlx::query_as::<_, (i64,)>(
                "SELECT id FROM stations WHERE status IN ('active', 'inactive') ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut loaded = Vec::with_capacity(rows.len());
            for (id,) in rows {
                if let Some(station) = stations::load_station(&self.pool, id).await? {
                    loaded.push(station);
                }
            }
            loaded
        };

        for station in all {
            let slow_turn = tick_count % SLOW_PROBE_DIVISOR == 0;
            if station.status == StationStatus::Inactive && !slow_turn {
                continue;
            }
            self.probe_station(&station).await?;
        }

        if tick_count % PRUNE_DIVISOR == 0 {
            let removed =
                stations::cleanup_old_health_records(&self.pool, HEALTH_RETENTION_DAYS).await?;
            if removed > 0 {
                tracing::debug!(removed, "pruned old health records");
            }
        }

        Ok(())
    }

    async fn probe_station(&mut self, station: &Station) -> DetectResult<()> {
        let result = self.checker.check(&station.stream_url).await;
        let healthy = result.status.is_healthy();

        stations::insert_health_record(
            &self.pool,
            station.id,
            result.status.as_str(),
            Some(result.latency_ms as i64),
            result.content_type.as_deref(),
            result.error.as_deref(),
        )
        .await?;

        let failure_count =
            stations::record_station_check(&self.pool, station.id, healthy, Utc::now()).await?;

        match station.status {
            StationStatus::Active if !healthy => {
                tracing::warn!(
                    station_id = station.id,
                    name = %station.name,
                    failures = failure_count,
                    probe = result.status.as_str(),
                    "health probe failed"
                );
                if failure_count >= FAILURE_THRESHOLD {
                    tracing::warn!(
                        station_id = station.id,
                        name = %station.name,
                        "marking station inactive after repeated failures"
                    );
                    stations::update_station_status(&self.pool, station.id, StationStatus::Inactive)
                        .await?;
                    self.stop_worker(station.id).await;
                    self.event_bus.publish(MonitorEvent::StationHealthChanged {
                        station_id: station.id,
                        status: StationStatus::Inactive,
                        latency_ms: Some(result.latency_ms),
                        reason: result.error.clone(),
                    });
                }
            }
            StationStatus::Active if healthy => {
                // A worker that died on a fatal error (database down)
                // gets respawned here; the probe rhythm is its backoff.
                let needs_respawn = self
                    .workers
                    .get(&station.id)
                    .map_or(true, |w| w.handle.is_finished());
                if needs_respawn {
                    if self.workers.remove(&station.id).is_some() {
                        tracing::warn!(
                            station_id = station.id,
                            name = %station.name,
                            "worker found dead, respawning"
                        );
                    }
                    self.spawn_worker(station);
                }
            }
            StationStatus::Inactive if healthy => {
                tracing::info!(
                    station_id = station.id,
                    name = %station.name,
                    "station recovered"
                );
                stations::update_station_status(&self.pool, station.id, StationStatus::Active)
                    .await?;
                if let Some(station) = stations::load_station(&self.pool, station.id).await? {
                    self.spawn_worker(&station);
                }
                self.event_bus.publish(MonitorEvent::StationHealthChanged {
                    station_id: station.id,
                    status: StationStatus::Active,
                    latency_ms: Some(result.latency_ms),
                    reason: None,
                });
            }
            _ => {}
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: StationCommand) -> DetectResult<()> {
        match command {
            StationCommand::Add(station_id) => {
                let Some(station) = stations::load_station(&self.pool, station_id).await? else {
                    tracing::warn!(station_id, "add command for unknown station");
                    return Ok(());
                };
                stations::update_station_status(&self.pool, station_id, StationStatus::Active)
                    .await?;
                self.spawn_worker(&station);
            }
            StationCommand::Remove(station_id) => {
                self.stop_worker(station_id).await;
                stations::update_station_status(&self.pool, station_id, StationStatus::Offline)
                    .await?;
                self.event_bus.publish(MonitorEvent::StationHealthChanged {
                    station_id,
                    status: StationStatus::Offline,
                    latency_ms: None,
                    reason: Some("removed by operator".to_string()),
                });
            }
        }
        Ok(())
    }

    /// Cancel every worker, wait out the grace period, abort stragglers.
    async fn graceful_shutdown(&mut self) {
        tracing::info!(
            workers = self.workers.len(),
            grace_s = self.settings.shutdown_grace,
            "shutting down workers"
        );

        for worker in self.workers.values() {
            worker.cancel.cancel();
        }

        let grace = Duration::from_secs_f64(self.settings.shutdown_grace);
        let deadline = tokio::time::Instant::now() + grace;

        for (station_id, mut worker) in self.workers.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut worker.handle).await {
                Ok(_) => tracing::debug!(station_id, "worker drained"),
                Err(_) => {
                    tracing::warn!(station_id, "grace period elapsed, aborting worker");
                    worker.handle.abort();
                }
            }
        }

        tracing::info!("supervisor stopped");
    }
}

//! Pipeline orchestration: composes capture, aggregation, enrichment,
//! scoring, persistence and notification, owns every lifetime, and shuts
//! down in dependency order.
//!
//! Data path: capture thread → bounded channel → ingest task → aggregator
//! → (identifier, geo, device registry) → finalised flow → (threat engine,
//! store batch, notification fabric). A finalised flow always reaches the
//! store before its related threat update is published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{self, CaptureHandle, CaptureStats};
use crate::config::AppConfig;
use crate::devices::DeviceRegistry;
use crate::error::StoreError;
use crate::flow::{
    AggregatorConfig, AggregatorStats, FlowAggregator, FlowDraft, FlowRecord, FlowStatus,
};
use crate::geo::GeoLookup;
use crate::identify::Identifier;
use crate::notify::{InitialState, NotificationFabric, Subscription};
use crate::packet::{DecodedPacket, Transport};
use crate::store::{CleanupStats, Store, StoreHealth};
use crate::threat::{Threat, ThreatConfig, ThreatEngine};

const SHUTDOWN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

enum PersistMsg {
    Item(Box<(FlowRecord, Option<Threat>)>),
    /// Force a flush and acknowledge once it is durable.
    Flush(oneshot::Sender<()>),
}

/// Read-only health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub capture: CaptureHealth,
    pub store: StoreHealth,
    pub subscribers: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureHealth {
    pub running: bool,
    pub interface: String,
    pub pps: f64,
    pub packets_captured: u64,
    pub flows_detected: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub ingest_queue_depth: usize,
    pub last_error: Option<String>,
}

/// Aggregator counters plus the ingest-queue view.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub aggregator: AggregatorStats,
    pub queue_depth: usize,
    pub packets_dropped: u64,
}

pub struct Pipeline {
    cfg: AppConfig,
    store: Store,
    identifier: Identifier,
    geo: GeoLookup,
    registry: DeviceRegistry,
    threat: ThreatEngine,
    aggregator: FlowAggregator,
    fabric: Arc<NotificationFabric>,
    capture_stats: Arc<CaptureStats>,
    capture_error: Mutex<Option<String>>,
    capture_handle: Mutex<Option<CaptureHandle>>,
    ingest_tx: Mutex<Option<mpsc::Sender<DecodedPacket>>>,
    persist_tx: Mutex<Option<mpsc::Sender<PersistMsg>>>,
    ingest_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    persist_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    packets_submitted: AtomicU64,
    packets_processed: AtomicU64,
    pps_window: Mutex<(Instant, u64)>,
}

impl Pipeline {
    /// Open the store and run migrations (a failure there refuses
    /// startup), initialise caches, start the workers, and attempt
    /// capture. A capture failure is recorded in health; the pipeline
    /// stays up.
    pub async fn start(cfg: AppConfig, db_path: &str) -> Result<Arc<Self>, StoreError> {
        let store = Store::open(db_path, cfg.storage.clone()).await?;
        let geo = GeoLookup::open(cfg.geo.database_path.as_deref());
        let identifier = Identifier::new(cfg.identify.clone());
        let registry = DeviceRegistry::new();
        match store.list_devices().await {
            Ok(devices) => {
                info!(count = devices.len(), "Preloaded known devices");
                registry.preload(devices);
            }
            Err(e) => warn!(error = %e, "Device preload failed; starting empty"),
        }

        let aggregator = FlowAggregator::new(AggregatorConfig {
            max_active_flows: cfg.capture.max_active_flows,
            idle_timeout: chrono::Duration::seconds(cfg.capture.idle_timeout_secs as i64),
            sampling_rate: cfg.capture.sampling_rate,
            rtt_tracker_size: cfg.capture.rtt_tracker_size,
            retrans_tracker_size: cfg.capture.retrans_tracker_size,
        });
        let fabric = NotificationFabric::new(cfg.notify.subscriber_queue_size);
        let threat = ThreatEngine::new(ThreatConfig::default());

        let (ingest_tx, ingest_rx) = mpsc::channel(cfg.capture.packet_queue_size.max(16));
        let (persist_tx, persist_rx) = mpsc::channel(cfg.storage.batch_size.max(16) * 4);

        let pipeline = Arc::new(Self {
            store,
            identifier,
            geo,
            registry,
            threat,
            aggregator,
            fabric,
            capture_stats: Arc::new(CaptureStats::default()),
            capture_error: Mutex::new(None),
            capture_handle: Mutex::new(None),
            ingest_tx: Mutex::new(Some(ingest_tx)),
            persist_tx: Mutex::new(Some(persist_tx)),
            ingest_task: tokio::sync::Mutex::new(None),
            persist_task: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            packets_submitted: AtomicU64::new(0),
            packets_processed: AtomicU64::new(0),
            pps_window: Mutex::new((Instant::now(), 0)),
            cfg,
        });

        *pipeline.ingest_task.lock().await =
            Some(tokio::spawn(pipeline.clone().ingest_loop(ingest_rx)));
        *pipeline.persist_task.lock().await =
            Some(tokio::spawn(pipeline.clone().persist_loop(persist_rx)));
        tokio::spawn(pipeline.clone().sweep_loop());
        tokio::spawn(pipeline.clone().cleanup_loop());

        pipeline.try_start_capture();
        Ok(pipeline)
    }

    /// Open the capture interface. An empty interface name means capture
    /// is intentionally disabled (tests, replay tooling).
    fn try_start_capture(self: &Arc<Self>) {
        let interface = self.cfg.capture.interface.clone();
        if interface.is_empty() {
            info!("Capture disabled (no interface configured)");
            return;
        }
        let tx = match self.ingest_tx.lock().expect("ingest sender lock").clone() {
            Some(tx) => tx,
            None => return,
        };
        match capture::start(
            &interface,
            &self.cfg.capture.bpf_filter,
            tx,
            self.capture_stats.clone(),
        ) {
            Ok(handle) => {
                *self.capture_handle.lock().expect("capture handle lock") = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "Capture unavailable; pipeline continues without it");
                *self.capture_error.lock().expect("capture error lock") = Some(e.to_string());
            }
        }
    }

    /// Non-blocking packet submission (the capture thread uses the same
    /// channel). Returns false when the queue is saturated and the packet
    /// was dropped.
    pub fn submit(&self, pkt: DecodedPacket) -> bool {
        let tx = match self.ingest_tx.lock().expect("ingest sender lock").clone() {
            Some(tx) => tx,
            None => return false,
        };
        match tx.try_send(pkt) {
            Ok(()) => {
                self.packets_submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.capture_stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wait until every packet submitted through [`submit`] has been
    /// processed by the aggregator. Bounded; used by replay tooling and
    /// tests.
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.packets_processed.load(Ordering::Acquire)
                >= self.packets_submitted.load(Ordering::Acquire)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        warn!("settle() gave up waiting for the ingest queue to drain");
    }

    async fn ingest_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DecodedPacket>) {
        while let Some(pkt) = rx.recv().await {
            self.handle_packet(pkt).await;
        }
        debug!("Ingest loop exited");
    }

    async fn handle_packet(&self, pkt: DecodedPacket) {
        let dns = if pkt.transport == Transport::Udp && !pkt.payload.is_empty() {
            self.identifier
                .observe_dns(&pkt.payload, pkt.src_port, pkt.dst_port)
        } else {
            None
        };
        let drafts = self
            .aggregator
            .process_packet(&pkt, &self.identifier, dns.as_ref());
        for draft in drafts {
            self.finalize(draft).await;
        }
        // Only after finalisation has reached the persistence channel, so
        // settle() + flush() really mean "everything submitted is durable".
        self.packets_processed.fetch_add(1, Ordering::Release);
    }

    /// Enrich a finalised flow, update the owning device, score it, and
    /// hand it to persistence and fan-out. Enrichment failures record the
    /// flow without the optional field; nothing here fails the pipeline.
    async fn finalize(&self, draft: FlowDraft) {
        let http_host = draft.http.as_ref().and_then(|h| h.host.clone());
        let domain = self
            .identifier
            .resolve_name(draft.key.dst_addr, http_host.as_deref(), draft.sni.as_deref())
            .await;
        let geo = self.geo.lookup(draft.key.dst_addr);
        let application = self.identifier.application(
            draft.app_observed,
            draft.alpn.as_deref(),
            draft.tls_seen,
            draft.key.dst_port,
        );

        let mut flow = FlowRecord {
            id: draft.id.clone(),
            device_id: None,
            src_ip: draft.key.src_addr,
            src_port: draft.key.src_port,
            dst_ip: draft.key.dst_addr,
            dst_port: draft.key.dst_port,
            protocol: draft.key.transport.as_str().to_string(),
            bytes_in: draft.bytes_in,
            bytes_out: draft.bytes_out,
            packets_in: draft.packets_in,
            packets_out: draft.packets_out,
            first_seen: draft.first_seen,
            last_seen: draft.last_seen,
            duration_ms: draft.duration_ms(),
            status: draft.status,
            domain,
            sni: draft.sni.clone(),
            application,
            http_method: draft.http.as_ref().map(|h| h.method.clone()),
            url: draft.http.as_ref().map(|h| h.url.clone()),
            user_agent: draft.http.as_ref().and_then(|h| h.user_agent.clone()),
            dns_query_type: draft.dns_query_type.map(str::to_string),
            dns_response_code: draft.dns_response_code.map(str::to_string),
            country: geo.country,
            city: geo.city,
            asn: geo.asn,
            tcp_flags: draft.tcp_flags,
            ttl: draft.ttl,
            connection_state: draft.connection_state,
            rtt_ms: draft.rtt_ms,
            jitter_ms: draft.jitter_ms,
            retransmissions: draft.retransmissions,
            threat_level: None,
        };

        let mut device = self.registry.observe_flow(&flow, draft.src_mac);
        flow.device_id = Some(device.id.clone());

        let threat = self.threat.evaluate(&flow);
        if let Some(threat) = &threat {
            flow.threat_level = Some(threat.severity.as_str().to_string());
            if let Some(updated) = self.registry.record_threat(&device.id, threat.score) {
                device = updated;
            }
        }

        if let Err(e) = self.store.upsert_device(&device).await {
            error!(device_id = %device.id, error = %e, "Device upsert failed");
        }
        self.fabric.publish_device(device);
        self.fabric.publish_flow(flow.clone());

        let tx = self.persist_tx.lock().expect("persist sender lock").clone();
        if let Some(tx) = tx {
            if tx.send(PersistMsg::Item(Box::new((flow, threat)))).await.is_err() {
                error!("Persistence channel closed; finalised flow lost");
            }
        }
    }

    /// Batch persister: flushes on size, timer, explicit request, or
    /// channel close. Threat updates publish only after the batch holding
    /// their flow is written.
    async fn persist_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PersistMsg>) {
        let batch_size = self.cfg.storage.batch_size.max(1);
        let mut buffer: Vec<(FlowRecord, Option<Threat>)> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.storage.batch_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(PersistMsg::Item(item)) => {
                        buffer.push(*item);
                        if buffer.len() >= batch_size {
                            self.flush_buffer(&mut buffer).await;
                        }
                    }
                    Some(PersistMsg::Flush(ack)) => {
                        self.flush_buffer(&mut buffer).await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush_buffer(&mut buffer).await;
                    }
                }
            }
        }
        // Channel closed (shutdown): final flush.
        self.flush_buffer(&mut buffer).await;
        debug!("Persist loop exited");
    }

    async fn flush_buffer(&self, buffer: &mut Vec<(FlowRecord, Option<Threat>)>) {
        if buffer.is_empty() {
            return;
        }
        let items = std::mem::take(buffer);
        let flows: Vec<FlowRecord> = items.iter().map(|(f, _)| f.clone()).collect();
        match self.store.insert_flows(&flows).await {
            Ok(inserted) => debug!(batch = flows.len(), inserted, "Flow batch written"),
            Err(e) => error!(batch = flows.len(), error = %e, "Flow batch write failed"),
        }
        for (_, threat) in items {
            let Some(threat) = threat else { continue };
            if let Err(e) = self.store.upsert_threat(&threat).await {
                error!(threat_id = %threat.id, error = %e, "Threat write failed");
            }
            self.fabric.publish_threat(threat);
        }
    }

    /// Force the current write batch to disk.
    pub async fn flush(&self) {
        let tx = self.persist_tx.lock().expect("persist sender lock").clone();
        if let Some(tx) = tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(PersistMsg::Flush(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let period = (self.cfg.capture.idle_timeout_secs / 4).clamp(1, 15);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_idle_now().await,
            }
        }
        debug!("Idle sweep loop exited");
    }

    /// Finalise flows past the idle timeout right now.
    pub async fn sweep_idle_now(&self) {
        let drafts = self.aggregator.sweep_idle(Utc::now());
        if drafts.is_empty() {
            return;
        }
        debug!(count = drafts.len(), "Idle flows finalised");
        for draft in drafts {
            self.finalize(draft).await;
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let hours = self.cfg.retention.cleanup_interval_hours.max(1);
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(hours * 3600));
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_cleanup().await {
                        Ok(stats) if stats.flows_deleted + stats.threats_deleted > 0 => {
                            info!(
                                flows = stats.flows_deleted,
                                threats = stats.threats_deleted,
                                "Periodic retention cleanup"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Periodic cleanup failed"),
                    }
                }
            }
        }
        debug!("Cleanup loop exited");
    }

    /// Run retention cleanup with the configured window (also the
    /// maintenance entry point for the adapter).
    pub async fn run_cleanup(&self) -> Result<CleanupStats, StoreError> {
        self.store.cleanup(self.cfg.retention.data_retention_days).await
    }

    /// Subscribe to live updates. The first message is the initial-state
    /// snapshot: known devices, active + recently closed flows (bounded),
    /// and active threats.
    pub async fn subscribe(&self) -> Subscription {
        let limit = self.cfg.notify.initial_flows_limit;
        let mut flows = self.aggregator.snapshot_active(limit);
        if flows.len() < limit {
            let recent = self
                .store
                .query_flows(&crate::store::FlowQuery {
                    limit: Some((limit - flows.len()) as i64),
                    status: Some(FlowStatus::Closed.as_str().to_string()),
                    ..Default::default()
                })
                .await
                .unwrap_or_default();
            flows.extend(recent);
        }
        let threats = self.store.list_threats(Some(true)).await.unwrap_or_default();
        self.fabric.subscribe(InitialState {
            devices: self.registry.all(),
            flows,
            threats,
        })
    }

    /// Apply an operator patch to a device, persist it, and notify
    /// subscribers. `NotFound` when the device is unknown.
    pub async fn update_device(
        &self,
        id: &str,
        patch: crate::devices::DevicePatch,
    ) -> Result<crate::devices::Device, StoreError> {
        let device = self
            .registry
            .apply_patch(id, patch)
            .ok_or(StoreError::NotFound)?;
        self.store.upsert_device(&device).await?;
        self.fabric.publish_device(device.clone());
        Ok(device)
    }

    /// Dismiss a threat (idempotent; the row is preserved) and notify
    /// subscribers of the flipped state.
    pub async fn dismiss_threat(&self, id: &str) -> Result<(), StoreError> {
        self.store.dismiss_threat(id).await?;
        if let Ok(threat) = self.store.get_threat(id).await {
            self.fabric.publish_threat(threat);
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn fabric(&self) -> &Arc<NotificationFabric> {
        &self.fabric
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_stats.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipelineStats {
        let queue_depth = self
            .ingest_tx
            .lock()
            .expect("ingest sender lock")
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        PipelineStats {
            aggregator: self.aggregator.stats(),
            queue_depth,
            packets_dropped: self.capture_stats.packets_dropped.load(Ordering::Relaxed),
        }
    }

    /// Read-only health snapshot for external monitors.
    pub fn health(&self) -> Health {
        let captured = self.capture_stats.packets_captured.load(Ordering::Relaxed)
            + self.packets_submitted.load(Ordering::Relaxed);
        let pps = {
            let mut window = self.pps_window.lock().expect("pps window lock");
            let elapsed = window.0.elapsed().as_secs_f64();
            let delta = captured.saturating_sub(window.1);
            if elapsed >= 1.0 {
                *window = (Instant::now(), captured);
            }
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };
        let aggregator = self.aggregator.stats();
        Health {
            capture: CaptureHealth {
                running: self.is_capturing(),
                interface: self.cfg.capture.interface.clone(),
                pps,
                packets_captured: captured,
                flows_detected: aggregator.flows_created,
                dropped: self.capture_stats.packets_dropped.load(Ordering::Relaxed),
                decode_errors: self.capture_stats.decode_errors.load(Ordering::Relaxed),
                ingest_queue_depth: self.stats().queue_depth,
                last_error: self.capture_error.lock().expect("capture error lock").clone(),
            },
            store: self.store.health(),
            subscribers: self.fabric.subscriber_count(),
            queue_depth: self.fabric.queue_depth(),
        }
    }

    /// Orderly shutdown: stop capture, drain the ingest queue, force-
    /// finalise every active flow, flush the write batch, then close the
    /// store and all subscriber streams. Bounded by a 10 s deadline.
    pub async fn stop(&self) {
        info!("Pipeline stopping");
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;

        let handle = self.capture_handle.lock().expect("capture handle lock").take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        }

        // No more producers: the ingest loop drains the queue and exits.
        self.ingest_tx.lock().expect("ingest sender lock").take();
        if let Some(task) = self.ingest_task.lock().await.take() {
            if join_until(task, deadline).await.is_err() {
                warn!("Ingest loop did not drain before the shutdown deadline");
            }
        }

        // Force-finalise whatever is still active.
        let drafts = self.aggregator.drain_all();
        if !drafts.is_empty() {
            info!(count = drafts.len(), "Finalising active flows on shutdown");
        }
        for draft in drafts {
            self.finalize(draft).await;
        }

        // Close the persistence channel: final flush happens on the way out.
        self.persist_tx.lock().expect("persist sender lock").take();
        if let Some(task) = self.persist_task.lock().await.take() {
            if join_until(task, deadline).await.is_err() {
                warn!("Persist loop did not flush before the shutdown deadline");
            }
        }

        self.cancel.cancel();
        self.fabric.close_all();
        self.store.close().await;
        info!("Pipeline stopped");
    }
}

async fn join_until(task: JoinHandle<()>, deadline: Instant) -> Result<(), ()> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, task).await {
        Ok(_) => Ok(()),
        Err(_) => Err(()),
    }
}

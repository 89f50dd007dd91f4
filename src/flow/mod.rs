//! Flow aggregation: packets in, finalised bidirectional flows out.
//!
//! The aggregator owns the bounded active-flow map behind a single
//! exclusive lock, held only to read or mutate an entry. Payload
//! extraction happens before the lock; RTT/retransmission side-tables
//! ([`rtt`]) have their own locks and are consulted after it. Flows
//! finalise on TCP close, idle timeout, cap eviction or shutdown, and the
//! aggregator never fails the pipeline: anything malformed is a counter
//! bump, not an error.

pub mod rtt;

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identify::{DnsObservation, HttpRequest, Identifier};
use crate::packet::{DecodedPacket, Transport, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};

const JITTER_SAMPLE_WINDOW: usize = 20;
const DUPLICATE_WINDOW_MS: i64 = 1;

/// Canonical 5-tuple. The stored orientation is the initiator's: `src_*`
/// belongs to whoever sent the first packet of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
}

impl FlowKey {
    pub fn of(pkt: &DecodedPacket) -> Self {
        Self {
            src_addr: pkt.src_addr,
            src_port: pkt.src_port,
            dst_addr: pkt.dst_addr,
            dst_port: pkt.dst_port,
            transport: pkt.transport,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
            transport: self.transport,
        }
    }
}

/// Packet direction relative to the flow's stored orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Initiator → responder.
    Out,
    /// Responder → initiator.
    In,
}

/// TCP connection state, coarse-grained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Init,
    SynSent,
    Established,
    FinWait,
    Closed,
    Reset,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "INIT",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait => "FIN_WAIT",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Reset => "RESET",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SYN_SENT" => ConnectionState::SynSent,
            "ESTABLISHED" => ConnectionState::Established,
            "FIN_WAIT" => ConnectionState::FinWait,
            "CLOSED" => ConnectionState::Closed,
            "RESET" => ConnectionState::Reset,
            _ => ConnectionState::Init,
        }
    }
}

/// Persisted flow status. `Closed` is terminal: a finalised flow is written
/// exactly once and never rewritten; further traffic on the same 5-tuple
/// opens a new flow with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Active,
    Closed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Active => "ACTIVE",
            FlowStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "ACTIVE" {
            FlowStatus::Active
        } else {
            FlowStatus::Closed
        }
    }
}

/// A finalised, fully enriched flow, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: FlowStatus,
    pub domain: Option<String>,
    pub sni: Option<String>,
    pub application: Option<String>,
    pub http_method: Option<String>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub dns_query_type: Option<String>,
    pub dns_response_code: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub tcp_flags: u8,
    pub ttl: Option<u8>,
    pub connection_state: ConnectionState,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub retransmissions: u32,
    pub threat_level: Option<String>,
}

/// A finalised flow before the I/O-bearing enrichment pass (reverse DNS,
/// geo, device registry). Detached from the active map: building one never
/// holds the map lock across enrichment.
#[derive(Debug, Clone)]
pub struct FlowDraft {
    pub id: String,
    pub key: FlowKey,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: FlowStatus,
    pub connection_state: ConnectionState,
    pub tcp_flags: u8,
    pub ttl: Option<u8>,
    pub src_mac: Option<[u8; 6]>,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub http: Option<HttpRequest>,
    pub app_observed: Option<&'static str>,
    pub tls_seen: bool,
    pub dns_query_type: Option<&'static str>,
    pub dns_response_code: Option<&'static str>,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub retransmissions: u32,
}

impl FlowDraft {
    pub fn duration_ms(&self) -> i64 {
        (self.last_seen - self.first_seen).num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// Active flow state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FlowState {
    id: String,
    key: FlowKey,
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u64,
    packets_out: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    tcp_flags: u8,
    ttl: Option<u8>,
    state: ConnectionState,
    fin_out: bool,
    fin_in: bool,
    src_mac: Option<[u8; 6]>,
    sni: Option<String>,
    alpn: Option<String>,
    http: Option<HttpRequest>,
    app_observed: Option<&'static str>,
    tls_seen: bool,
    dns_query_type: Option<&'static str>,
    dns_response_code: Option<&'static str>,
    // Jitter: mean absolute difference of consecutive inter-arrival times.
    last_arrival: Option<DateTime<Utc>>,
    last_delta_ms: Option<f64>,
    jitter_window: VecDeque<f64>,
}

impl FlowState {
    fn new(pkt: &DecodedPacket) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key: FlowKey::of(pkt),
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            first_seen: pkt.timestamp,
            last_seen: pkt.timestamp,
            tcp_flags: 0,
            ttl: pkt.ttl,
            state: if pkt.transport == Transport::Tcp {
                ConnectionState::Init
            } else {
                ConnectionState::Established
            },
            fin_out: false,
            fin_in: false,
            src_mac: pkt.src_mac,
            sni: None,
            alpn: None,
            http: None,
            app_observed: None,
            tls_seen: false,
            dns_query_type: None,
            dns_response_code: None,
            last_arrival: None,
            last_delta_ms: None,
            jitter_window: VecDeque::new(),
        }
    }

    fn update(
        &mut self,
        pkt: &DecodedPacket,
        direction: Direction,
        extracted: &Extracted,
        dns: Option<&DnsObservation>,
    ) {
        match direction {
            Direction::Out => {
                self.bytes_out += pkt.length as u64;
                self.packets_out += 1;
            }
            Direction::In => {
                self.bytes_in += pkt.length as u64;
                self.packets_in += 1;
            }
        }
        if pkt.timestamp > self.last_seen {
            self.last_seen = pkt.timestamp;
        }

        // Jitter sample from consecutive inter-arrival deltas.
        if let Some(prev) = self.last_arrival {
            let delta_ms = (pkt.timestamp - prev).num_microseconds().unwrap_or(0) as f64 / 1000.0;
            if let Some(prev_delta) = self.last_delta_ms {
                self.jitter_window.push_back((delta_ms - prev_delta).abs());
                while self.jitter_window.len() > JITTER_SAMPLE_WINDOW {
                    self.jitter_window.pop_front();
                }
            }
            self.last_delta_ms = Some(delta_ms);
        }
        self.last_arrival = Some(pkt.timestamp);

        if let Some(tcp) = pkt.tcp {
            self.tcp_flags |= tcp.flags;
            self.advance_state(tcp.flags, direction, !pkt.payload.is_empty());
        }

        if self.sni.is_none() {
            self.sni = extracted.sni.clone();
        }
        if self.alpn.is_none() {
            self.alpn = extracted.alpn.clone();
        }
        if self.http.is_none() {
            self.http = extracted.http.clone();
        }
        if self.app_observed.is_none() {
            self.app_observed = extracted.app_observed;
        }
        self.tls_seen |= extracted.tls_seen;

        if let Some(obs) = dns {
            if obs.query_type.is_some() {
                self.dns_query_type = obs.query_type;
            }
            if obs.response_code.is_some() {
                self.dns_response_code = obs.response_code;
            }
        }
    }

    fn advance_state(&mut self, flags: u8, direction: Direction, has_payload: bool) {
        if flags & TCP_RST != 0 {
            self.state = ConnectionState::Reset;
            return;
        }
        if flags & TCP_FIN != 0 {
            match direction {
                Direction::Out => self.fin_out = true,
                Direction::In => self.fin_in = true,
            }
            if self.state != ConnectionState::Closed {
                self.state = ConnectionState::FinWait;
            }
            return;
        }
        match self.state {
            ConnectionState::Init => {
                if flags & TCP_SYN != 0 && flags & TCP_ACK == 0 {
                    self.state = ConnectionState::SynSent;
                } else if has_payload {
                    self.state = ConnectionState::Established;
                }
            }
            ConnectionState::SynSent => {
                if flags & TCP_SYN != 0 && flags & TCP_ACK != 0 {
                    self.state = ConnectionState::Established;
                } else if has_payload && self.packets_in > 0 && self.packets_out > 0 {
                    self.state = ConnectionState::Established;
                }
            }
            ConnectionState::FinWait => {
                if self.fin_out && self.fin_in && flags & TCP_ACK != 0 {
                    self.state = ConnectionState::Closed;
                }
            }
            _ => {}
        }
    }

    fn is_terminated(&self) -> bool {
        matches!(self.state, ConnectionState::Closed | ConnectionState::Reset)
    }

    fn jitter_ms(&self) -> Option<f64> {
        if self.jitter_window.is_empty() {
            return None;
        }
        Some(self.jitter_window.iter().sum::<f64>() / self.jitter_window.len() as f64)
    }

    /// A status-`Active` snapshot for the initial-state message; carries the
    /// id the flow will keep once finalised.
    fn snapshot(&self) -> FlowRecord {
        FlowRecord {
            id: self.id.clone(),
            device_id: None,
            src_ip: self.key.src_addr,
            src_port: self.key.src_port,
            dst_ip: self.key.dst_addr,
            dst_port: self.key.dst_port,
            protocol: self.key.transport.as_str().to_string(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            packets_in: self.packets_in,
            packets_out: self.packets_out,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            duration_ms: (self.last_seen - self.first_seen).num_milliseconds(),
            status: FlowStatus::Active,
            domain: None,
            sni: self.sni.clone(),
            application: None,
            http_method: self.http.as_ref().map(|h| h.method.clone()),
            url: self.http.as_ref().map(|h| h.url.clone()),
            user_agent: self.http.as_ref().and_then(|h| h.user_agent.clone()),
            dns_query_type: self.dns_query_type.map(str::to_string),
            dns_response_code: self.dns_response_code.map(str::to_string),
            country: None,
            city: None,
            asn: None,
            tcp_flags: self.tcp_flags,
            ttl: self.ttl,
            connection_state: self.state,
            rtt_ms: None,
            jitter_ms: self.jitter_ms(),
            retransmissions: 0,
            threat_level: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling and duplicate suppression
// ---------------------------------------------------------------------------

enum Admit {
    Accept,
    SampledOut,
    Duplicate,
}

struct SamplingGate {
    /// Accept every `every`-th packet.
    every: u64,
    counter: u64,
    last_hash: u64,
    last_at: Option<DateTime<Utc>>,
}

impl SamplingGate {
    fn new(sampling_rate: f64) -> Self {
        let rate = sampling_rate.clamp(f64::MIN_POSITIVE, 1.0);
        Self {
            every: (1.0 / rate).ceil() as u64,
            counter: 0,
            last_hash: 0,
            last_at: None,
        }
    }

    fn admit(&mut self, at: DateTime<Utc>, length: u32) -> Admit {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        at.timestamp_micros().hash(&mut hasher);
        length.hash(&mut hasher);
        let hash = hasher.finish();

        if hash == self.last_hash {
            if let Some(last_at) = self.last_at {
                if (at - last_at).num_milliseconds() <= DUPLICATE_WINDOW_MS {
                    return Admit::Duplicate;
                }
            }
        }
        self.last_hash = hash;
        self.last_at = Some(at);

        let accepted = self.counter % self.every == 0;
        self.counter += 1;
        if accepted {
            Admit::Accept
        } else {
            Admit::SampledOut
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Aggregator tuning, pulled out of the capture config.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_active_flows: usize,
    pub idle_timeout: Duration,
    pub sampling_rate: f64,
    pub rtt_tracker_size: usize,
    pub retrans_tracker_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_active_flows: 10_000,
            idle_timeout: Duration::seconds(60),
            sampling_rate: 1.0,
            rtt_tracker_size: 5_000,
            retrans_tracker_size: 10_000,
        }
    }
}

/// Counter snapshot for the stats surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub active_flows: usize,
    pub packets_seen: u64,
    pub packets_accepted: u64,
    pub duplicates: u64,
    pub sampled_out: u64,
    pub flows_created: u64,
    pub flows_finalized: u64,
    pub avg_process_us: u64,
}

pub struct FlowAggregator {
    cfg: AggregatorConfig,
    active: Mutex<HashMap<FlowKey, FlowState>>,
    gate: Mutex<SamplingGate>,
    rtt: rtt::RttTracker,
    retrans: rtt::RetransTracker,
    packets_seen: AtomicU64,
    packets_accepted: AtomicU64,
    duplicates: AtomicU64,
    sampled_out: AtomicU64,
    flows_created: AtomicU64,
    flows_finalized: AtomicU64,
    process_us_sum: AtomicU64,
    process_count: AtomicU64,
}

/// Cheap per-packet payload extraction, done before the map lock.
#[derive(Debug, Default)]
struct Extracted {
    sni: Option<String>,
    alpn: Option<String>,
    http: Option<HttpRequest>,
    app_observed: Option<&'static str>,
    tls_seen: bool,
}

impl FlowAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        let gate = Mutex::new(SamplingGate::new(cfg.sampling_rate));
        let rtt = rtt::RttTracker::new(cfg.rtt_tracker_size);
        let retrans = rtt::RetransTracker::new(cfg.retrans_tracker_size);
        Self {
            cfg,
            active: Mutex::new(HashMap::new()),
            gate,
            rtt,
            retrans,
            packets_seen: AtomicU64::new(0),
            packets_accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            flows_created: AtomicU64::new(0),
            flows_finalized: AtomicU64::new(0),
            process_us_sum: AtomicU64::new(0),
            process_count: AtomicU64::new(0),
        }
    }

    /// Process one decoded packet. Returns the flows this packet finalised
    /// (TCP close, or oldest-idle eviction when the map is at capacity).
    pub fn process_packet(
        &self,
        pkt: &DecodedPacket,
        ident: &Identifier,
        dns: Option<&DnsObservation>,
    ) -> Vec<FlowDraft> {
        let started = Instant::now();
        self.packets_seen.fetch_add(1, Ordering::Relaxed);

        match self.gate.lock().expect("gate lock").admit(pkt.timestamp, pkt.length) {
            Admit::Accept => {}
            Admit::SampledOut => {
                self.sampled_out.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
            Admit::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        }
        self.packets_accepted.fetch_add(1, Ordering::Relaxed);

        let extracted = self.extract(pkt, ident);

        let mut ended_states: Vec<FlowState> = Vec::new();
        let key;
        let direction;
        {
            let mut active = self.active.lock().expect("active-flow lock");

            let forward = FlowKey::of(pkt);
            if active.contains_key(&forward) {
                key = forward;
                direction = Direction::Out;
            } else if active.contains_key(&forward.reversed()) {
                key = forward.reversed();
                direction = Direction::In;
            } else {
                if active.len() >= self.cfg.max_active_flows {
                    // Force-finalise the oldest-idle flow to make room.
                    if let Some(oldest) = active
                        .iter()
                        .min_by_key(|(_, st)| st.last_seen)
                        .map(|(k, _)| k.clone())
                    {
                        if let Some(st) = active.remove(&oldest) {
                            ended_states.push(st);
                        }
                    }
                }
                active.insert(forward.clone(), FlowState::new(pkt));
                self.flows_created.fetch_add(1, Ordering::Relaxed);
                key = forward;
                direction = Direction::Out;
            }

            let state = active.get_mut(&key).expect("entry just resolved");
            state.update(pkt, direction, &extracted, dns);
            if state.is_terminated() {
                if let Some(st) = active.remove(&key) {
                    ended_states.push(st);
                }
            }
        }

        // Timing side-tables, outside the active-map lock.
        if let Some(tcp) = pkt.tcp {
            let syn = tcp.flags & TCP_SYN != 0;
            let ack = tcp.flags & TCP_ACK != 0;
            if syn && !ack && direction == Direction::Out {
                self.rtt.observe_syn(&key, pkt.timestamp);
            } else if ack && direction == Direction::In {
                self.rtt.observe_ack(&key, pkt.timestamp);
            }
            // Pure ACKs legitimately reuse a sequence number; only
            // data-bearing or SYN/FIN segments count.
            if !pkt.payload.is_empty() || syn || tcp.flags & TCP_FIN != 0 {
                self.retrans.observe(&key, direction, tcp.seq, pkt.timestamp);
            }
        }

        let drafts = ended_states
            .into_iter()
            .map(|st| self.draft(st))
            .collect();

        self.process_us_sum
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.process_count.fetch_add(1, Ordering::Relaxed);
        drafts
    }

    fn extract(&self, pkt: &DecodedPacket, ident: &Identifier) -> Extracted {
        let mut out = Extracted::default();
        if pkt.payload.is_empty() {
            return out;
        }
        let payload = &pkt.payload;

        if crate::identify::tls::looks_like_tls(payload) {
            out.tls_seen = true;
            out.sni = ident.extract_sni(payload);
            out.alpn = ident.extract_alpn(payload);
            return out;
        }
        if let Some(req) = ident.extract_http(payload) {
            out.http = Some(req);
            out.app_observed = Some("HTTP");
            return out;
        }
        // Banners come from the server side, so try the sender's port first.
        out.app_observed = ident
            .fingerprint_banner(payload, pkt.src_port)
            .or_else(|| ident.classify_dpi(payload, pkt.dst_port))
            .or_else(|| ident.classify_dpi(payload, pkt.src_port));
        out
    }

    /// Build the detached pre-enrichment record, draining the timing
    /// side-tables for this key.
    fn draft(&self, st: FlowState) -> FlowDraft {
        self.flows_finalized.fetch_add(1, Ordering::Relaxed);
        let status = if st.is_terminated() {
            FlowStatus::Closed
        } else {
            // Idle / eviction / shutdown: the record is final (and will
            // never be rewritten) but the conversation was not observed to
            // close.
            FlowStatus::Active
        };
        FlowDraft {
            rtt_ms: self.rtt.take_mean(&st.key),
            retransmissions: self.retrans.take_count(&st.key),
            jitter_ms: st.jitter_ms(),
            id: st.id,
            key: st.key,
            bytes_in: st.bytes_in,
            bytes_out: st.bytes_out,
            packets_in: st.packets_in,
            packets_out: st.packets_out,
            first_seen: st.first_seen,
            last_seen: st.last_seen,
            status,
            connection_state: st.state,
            tcp_flags: st.tcp_flags,
            ttl: st.ttl,
            src_mac: st.src_mac,
            sni: st.sni,
            alpn: st.alpn,
            http: st.http,
            app_observed: st.app_observed,
            tls_seen: st.tls_seen,
            dns_query_type: st.dns_query_type,
            dns_response_code: st.dns_response_code,
        }
    }

    /// Finalise all flows idle longer than the configured timeout.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<FlowDraft> {
        let cutoff = now - self.cfg.idle_timeout;
        let ended: Vec<FlowState> = {
            let mut active = self.active.lock().expect("active-flow lock");
            let keys: Vec<FlowKey> = active
                .iter()
                .filter(|(_, st)| st.last_seen < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| active.remove(&k)).collect()
        };
        ended.into_iter().map(|st| self.draft(st)).collect()
    }

    /// Finalise everything (shutdown).
    pub fn drain_all(&self) -> Vec<FlowDraft> {
        let ended: Vec<FlowState> = {
            let mut active = self.active.lock().expect("active-flow lock");
            let keys: Vec<FlowKey> = active.keys().cloned().collect();
            keys.into_iter().filter_map(|k| active.remove(&k)).collect()
        };
        ended.into_iter().map(|st| self.draft(st)).collect()
    }

    /// Status-`Active` snapshots of up to `limit` current flows, newest
    /// first, for the initial-state message.
    pub fn snapshot_active(&self, limit: usize) -> Vec<FlowRecord> {
        let active = self.active.lock().expect("active-flow lock");
        let mut flows: Vec<FlowRecord> = active.values().map(|st| st.snapshot()).collect();
        flows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        flows.truncate(limit);
        flows
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active-flow lock").len()
    }

    pub fn stats(&self) -> AggregatorStats {
        let count = self.process_count.load(Ordering::Relaxed);
        let avg_process_us = if count == 0 {
            0
        } else {
            self.process_us_sum.load(Ordering::Relaxed) / count
        };
        AggregatorStats {
            active_flows: self.active_count(),
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            packets_accepted: self.packets_accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_finalized: self.flows_finalized.load(Ordering::Relaxed),
            avg_process_us,
        }
    }
}

#[cfg(test)]
pub mod testutil {
    //! Packet literals for aggregator and pipeline tests.

    use super::*;
    use crate::packet::TcpMeta;

    pub fn tcp_packet(
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        flags: u8,
        seq: u32,
        payload: &[u8],
        ts: DateTime<Utc>,
    ) -> DecodedPacket {
        DecodedPacket {
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            transport: Transport::Tcp,
            length: 60 + payload.len() as u32,
            timestamp: ts,
            src_mac: Some([0xB8, 0x27, 0xEB, 0, 0, 1]),
            dst_mac: Some([0xAA, 0xBB, 0xCC, 0, 0, 2]),
            tcp: Some(TcpMeta {
                flags,
                seq,
                ack: 0,
                window: 1024,
            }),
            ttl: Some(64),
            payload: payload.to_vec(),
        }
    }

    pub fn udp_packet(
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        payload: &[u8],
        ts: DateTime<Utc>,
    ) -> DecodedPacket {
        DecodedPacket {
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            transport: Transport::Udp,
            length: 42 + payload.len() as u32,
            timestamp: ts,
            src_mac: Some([0xB8, 0x27, 0xEB, 0, 0, 1]),
            dst_mac: None,
            tcp: None,
            ttl: Some(64),
            payload: payload.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::config::IdentifyConfig;

    fn ident() -> Identifier {
        Identifier::new(IdentifyConfig {
            enable_reverse_dns: false,
            ..IdentifyConfig::default()
        })
    }

    fn aggregator() -> FlowAggregator {
        FlowAggregator::new(AggregatorConfig::default())
    }

    #[test]
    fn bidirectional_packets_share_a_flow() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();

        let out = tcp_packet("10.0.0.5", 50000, "10.0.0.6", 80, TCP_SYN, 1, b"", t0);
        let back = tcp_packet(
            "10.0.0.6",
            80,
            "10.0.0.5",
            50000,
            TCP_SYN | TCP_ACK,
            900,
            b"",
            t0 + Duration::milliseconds(20),
        );

        assert!(agg.process_packet(&out, &id, None).is_empty());
        assert!(agg.process_packet(&back, &id, None).is_empty());

        assert_eq!(agg.active_count(), 1);
        let snap = &agg.snapshot_active(10)[0];
        assert_eq!(snap.packets_out, 1);
        assert_eq!(snap.packets_in, 1);
        assert_eq!(snap.src_port, 50000, "orientation follows the initiator");
        assert_eq!(snap.connection_state, ConnectionState::Established);
    }

    #[test]
    fn rst_finalises_with_reset_state() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();

        agg.process_packet(
            &tcp_packet("10.0.0.5", 50001, "10.0.0.6", 80, TCP_SYN, 1, b"", t0),
            &id,
            None,
        );
        let drafts = agg.process_packet(
            &tcp_packet(
                "10.0.0.6",
                80,
                "10.0.0.5",
                50001,
                TCP_RST,
                1,
                b"",
                t0 + Duration::milliseconds(5),
            ),
            &id,
            None,
        );

        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.connection_state, ConnectionState::Reset);
        assert_eq!(draft.status, FlowStatus::Closed);
        assert_eq!(agg.active_count(), 0);
        assert!(draft.tcp_flags & TCP_RST != 0);
        assert!(draft.tcp_flags & TCP_SYN != 0, "flags union over lifetime");
    }

    #[test]
    fn both_sided_fin_ack_closes() {
        let agg = aggregator();
        let id = ident();
        let mut t = Utc::now();
        let mut step = |agg: &FlowAggregator,
                        src: &str,
                        sport: u16,
                        dst: &str,
                        dport: u16,
                        flags: u8,
                        seq: u32| {
            t += Duration::milliseconds(10);
            agg.process_packet(
                &tcp_packet(src, sport, dst, dport, flags, seq, b"", t),
                &id,
                None,
            )
        };

        step(&agg, "10.0.0.5", 50002, "10.0.0.6", 80, TCP_SYN, 1);
        step(&agg, "10.0.0.6", 80, "10.0.0.5", 50002, TCP_SYN | TCP_ACK, 1);
        step(&agg, "10.0.0.5", 50002, "10.0.0.6", 80, TCP_FIN | TCP_ACK, 2);
        step(&agg, "10.0.0.6", 80, "10.0.0.5", 50002, TCP_FIN | TCP_ACK, 2);
        let drafts = step(&agg, "10.0.0.5", 50002, "10.0.0.6", 80, TCP_ACK, 3);

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].connection_state, ConnectionState::Closed);
        assert_eq!(drafts[0].status, FlowStatus::Closed);
    }

    #[test]
    fn idle_sweep_finalises_stale_flows() {
        let agg = FlowAggregator::new(AggregatorConfig {
            idle_timeout: Duration::seconds(60),
            ..AggregatorConfig::default()
        });
        let id = ident();
        let t0 = Utc::now();

        agg.process_packet(
            &tcp_packet("10.0.0.5", 50003, "10.0.0.6", 22, TCP_SYN, 1, b"", t0),
            &id,
            None,
        );
        assert!(agg.sweep_idle(t0 + Duration::seconds(30)).is_empty());

        let drafts = agg.sweep_idle(t0 + Duration::seconds(61));
        assert_eq!(drafts.len(), 1);
        // Idle finalisation: record is final but the close was not observed.
        assert_eq!(drafts[0].status, FlowStatus::Active);
        assert_eq!(agg.active_count(), 0);
    }

    #[test]
    fn cap_eviction_finalises_oldest_idle() {
        let agg = FlowAggregator::new(AggregatorConfig {
            max_active_flows: 2,
            ..AggregatorConfig::default()
        });
        let id = ident();
        let t0 = Utc::now();

        for (i, port) in [(0i64, 10001u16), (1, 10002), (2, 10003)] {
            let drafts = agg.process_packet(
                &tcp_packet(
                    "10.0.0.5",
                    port,
                    "10.0.0.6",
                    80,
                    TCP_SYN,
                    1,
                    b"",
                    t0 + Duration::seconds(i),
                ),
                &id,
                None,
            );
            if i < 2 {
                assert!(drafts.is_empty());
            } else {
                assert_eq!(drafts.len(), 1, "third insert evicts the oldest");
                assert_eq!(drafts[0].key.src_port, 10001);
            }
        }
        assert_eq!(agg.active_count(), 2);
    }

    #[test]
    fn sampling_gate_accepts_every_other() {
        let agg = FlowAggregator::new(AggregatorConfig {
            sampling_rate: 0.5,
            ..AggregatorConfig::default()
        });
        let id = ident();
        let t0 = Utc::now();

        for i in 0..10u32 {
            // Vary length so the duplicate gate stays out of the way.
            let mut pkt = tcp_packet("10.0.0.5", 50004, "10.0.0.6", 80, TCP_ACK, i, b"", t0);
            pkt.timestamp = t0 + Duration::milliseconds(i as i64 * 10);
            pkt.length = 60 + i;
            agg.process_packet(&pkt, &id, None);
        }
        let stats = agg.stats();
        assert_eq!(stats.packets_seen, 10);
        assert_eq!(stats.packets_accepted, 5);
        assert_eq!(stats.sampled_out, 5);
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();

        let pkt = tcp_packet("10.0.0.5", 50005, "10.0.0.6", 80, TCP_ACK, 1, b"", t0);
        agg.process_packet(&pkt, &id, None);
        agg.process_packet(&pkt.clone(), &id, None);

        let stats = agg.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.packets_accepted, 1);
    }

    #[test]
    fn handshake_yields_rtt_sample() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();

        agg.process_packet(
            &tcp_packet("10.0.0.5", 50006, "10.0.0.6", 443, TCP_SYN, 1, b"", t0),
            &id,
            None,
        );
        agg.process_packet(
            &tcp_packet(
                "10.0.0.6",
                443,
                "10.0.0.5",
                50006,
                TCP_SYN | TCP_ACK,
                1,
                b"",
                t0 + Duration::milliseconds(35),
            ),
            &id,
            None,
        );
        let drafts = agg.process_packet(
            &tcp_packet(
                "10.0.0.6",
                443,
                "10.0.0.5",
                50006,
                TCP_RST,
                2,
                b"",
                t0 + Duration::milliseconds(40),
            ),
            &id,
            None,
        );

        let rtt = drafts[0].rtt_ms.expect("handshake should sample rtt");
        assert!((rtt - 35.0).abs() < 2.0, "rtt {rtt}");
    }

    #[test]
    fn repeated_sequence_numbers_count_as_retransmissions() {
        let agg = aggregator();
        let id = ident();
        let mut t = Utc::now();

        agg.process_packet(
            &tcp_packet("10.0.0.5", 50007, "10.0.0.6", 80, TCP_SYN, 0, b"", t),
            &id,
            None,
        );
        for seq in [100u32, 200, 100, 300, 200] {
            t += Duration::milliseconds(10);
            agg.process_packet(
                &tcp_packet("10.0.0.5", 50007, "10.0.0.6", 80, TCP_ACK, seq, b"data", t),
                &id,
                None,
            );
        }
        t += Duration::milliseconds(10);
        let drafts = agg.process_packet(
            &tcp_packet("10.0.0.6", 80, "10.0.0.5", 50007, TCP_RST, 0, b"", t),
            &id,
            None,
        );
        assert_eq!(drafts[0].retransmissions, 2);
    }

    #[test]
    fn sni_lands_on_the_flow() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();
        let hello = crate::identify::tls::testutil::build_client_hello(
            Some("example.com"),
            &["h2"],
        );

        agg.process_packet(
            &tcp_packet("10.0.0.5", 50008, "93.184.216.34", 443, TCP_SYN, 0, b"", t0),
            &id,
            None,
        );
        agg.process_packet(
            &tcp_packet(
                "10.0.0.5",
                50008,
                "93.184.216.34",
                443,
                TCP_ACK,
                1,
                &hello,
                t0 + Duration::milliseconds(30),
            ),
            &id,
            None,
        );

        let snap = &agg.snapshot_active(1)[0];
        assert_eq!(snap.sni.as_deref(), Some("example.com"));

        let drafts = agg.drain_all();
        assert_eq!(drafts[0].alpn.as_deref(), Some("h2"));
        assert!(drafts[0].tls_seen);
    }

    #[test]
    fn udp_flows_stay_established() {
        let agg = aggregator();
        let id = ident();
        let t0 = Utc::now();

        agg.process_packet(
            &udp_packet("10.0.0.5", 40000, "8.8.8.8", 53, b"\x00\x01", t0),
            &id,
            None,
        );
        let snap = &agg.snapshot_active(1)[0];
        assert_eq!(snap.connection_state, ConnectionState::Established);
        assert_eq!(snap.protocol, "UDP");
    }

    #[test]
    fn byte_accounting_matches_packet_lengths() {
        let agg = aggregator();
        let id = ident();
        let mut t = Utc::now();
        let mut sent = 0u64;
        let mut received = 0u64;

        for i in 0..5u32 {
            t += Duration::milliseconds(7);
            let pkt = tcp_packet(
                "10.0.0.5",
                50009,
                "10.0.0.6",
                80,
                TCP_ACK,
                i,
                &vec![0u8; i as usize],
                t,
            );
            sent += pkt.length as u64;
            agg.process_packet(&pkt, &id, None);

            t += Duration::milliseconds(7);
            let pkt = tcp_packet(
                "10.0.0.6",
                80,
                "10.0.0.5",
                50009,
                TCP_ACK,
                i,
                &vec![0u8; (i * 2) as usize],
                t,
            );
            received += pkt.length as u64;
            agg.process_packet(&pkt, &id, None);
        }

        let drafts = agg.drain_all();
        assert_eq!(drafts[0].bytes_out, sent);
        assert_eq!(drafts[0].bytes_in, received);
        assert_eq!(drafts[0].packets_out, 5);
        assert_eq!(drafts[0].packets_in, 5);
        assert!(drafts[0].first_seen <= drafts[0].last_seen);
        assert!(drafts[0].jitter_ms.is_some());
    }
}

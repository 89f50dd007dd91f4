//! Rule-scored threat classification over finalised flows.
//!
//! Each rule contributes a weighted score (0–25); the total maps to a
//! severity. The engine is stateless across flows except for short
//! 5-minute sliding windows (per-source SYN-only flows, RESET flows and
//! DNS failures). It is the only writer of Threat records.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::{ConnectionState, FlowRecord};
use crate::identify::dpi;
use crate::packet::{TCP_ACK, TCP_RST, TCP_SYN};

const SCORE_CAP: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Severity for a total score: ≥70 critical, ≥50 high, ≥30 medium,
    /// ≥15 low, below that no threat.
    pub fn classify(score: i64) -> Option<Self> {
        match score {
            s if s >= 70 => Some(Severity::Critical),
            s if s >= 50 => Some(Severity::High),
            s if s >= 30 => Some(Severity::Medium),
            s if s >= 15 => Some(Severity::Low),
            _ => None,
        }
    }
}

/// A scored finding. Appended once; only the `active` flag ever changes
/// (dismissal), and dismissal preserves the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub score: i64,
    pub device_id: Option<String>,
    pub flow_id: Option<String>,
    pub description: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    pub evidence: BTreeMap<String, String>,
}

/// Rule tuning. The pattern and country lists mirror what the operator
/// would curate; the defaults cover the obvious cases.
#[derive(Debug, Clone)]
pub struct ThreatConfig {
    /// Substrings matched against SNI and domain (free TLDs, typosquat
    /// markers).
    pub suspicious_patterns: Vec<String>,
    /// ISO country codes treated as exfiltration risks.
    pub high_risk_countries: Vec<String>,
    /// SYN-only flows from one source within the window before the scan
    /// rule escalates.
    pub syn_burst_threshold: usize,
    /// RESET flows from one source within the window.
    pub rst_burst_threshold: usize,
    /// Failed DNS responses from one source within the window.
    pub dns_failure_threshold: usize,
    pub window: Duration,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            suspicious_patterns: [
                ".tk", ".ml", ".ga", ".cf", ".gq", ".top", "login-", "secure-", "-verify",
                "account-update",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            high_risk_countries: ["KP", "IR", "SY", "CU"].iter().map(|s| s.to_string()).collect(),
            syn_burst_threshold: 10,
            rst_burst_threshold: 10,
            dns_failure_threshold: 10,
            window: Duration::minutes(5),
        }
    }
}

/// Per-source event timestamps pruned to a sliding window.
struct SlidingWindow {
    events: Mutex<HashMap<IpAddr, VecDeque<DateTime<Utc>>>>,
    window: Duration,
}

impl SlidingWindow {
    fn new(window: Duration) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record an event and return how many fall inside the window.
    fn record(&self, addr: IpAddr, now: DateTime<Utc>) -> usize {
        let mut map = self.events.lock().expect("window lock");
        let queue = map.entry(addr).or_default();
        let cutoff = now - self.window;
        while queue.front().is_some_and(|t| *t < cutoff) {
            queue.pop_front();
        }
        queue.push_back(now);
        queue.len()
    }
}

struct RuleHit {
    kind: &'static str,
    score: i64,
    detail: String,
}

pub struct ThreatEngine {
    cfg: ThreatConfig,
    syn_bursts: SlidingWindow,
    rst_bursts: SlidingWindow,
    dns_failures: SlidingWindow,
}

impl ThreatEngine {
    pub fn new(cfg: ThreatConfig) -> Self {
        let window = cfg.window;
        Self {
            cfg,
            syn_bursts: SlidingWindow::new(window),
            rst_bursts: SlidingWindow::new(window),
            dns_failures: SlidingWindow::new(window),
        }
    }

    /// Score a finalised flow. Returns a Threat when the total crosses the
    /// lowest severity threshold.
    pub fn evaluate(&self, flow: &FlowRecord) -> Option<Threat> {
        let mut hits: Vec<RuleHit> = Vec::new();
        let now = flow.last_seen;
        let src = flow.src_ip;

        // RST observed without any SYN: probe of a non-listening port.
        if flow.tcp_flags & TCP_RST != 0 && flow.tcp_flags & TCP_SYN == 0 {
            hits.push(RuleHit {
                kind: "scan",
                score: 20,
                detail: "RST without SYN".to_string(),
            });
        }

        // SYN that never completed a handshake; repeated occurrences from
        // the same source escalate.
        if flow.connection_state == ConnectionState::SynSent && flow.tcp_flags & TCP_ACK == 0 {
            hits.push(RuleHit {
                kind: "scan",
                score: 15,
                detail: format!("unanswered SYN to port {}", flow.dst_port),
            });
            let burst = self.syn_bursts.record(src, now);
            if burst >= self.cfg.syn_burst_threshold {
                hits.push(RuleHit {
                    kind: "scan",
                    score: 25,
                    detail: format!("{burst} unanswered SYNs from {src} within window"),
                });
            }
        }

        // Retransmission ratio over 10%.
        if flow.packets_out > 0 {
            let ratio = flow.retransmissions as f64 / flow.packets_out as f64;
            if ratio > 0.10 {
                hits.push(RuleHit {
                    kind: "ddos",
                    score: 20,
                    detail: format!(
                        "retransmission ratio {:.0}% ({} of {})",
                        ratio * 100.0,
                        flow.retransmissions,
                        flow.packets_out
                    ),
                });
            }
        }

        // Degraded path: high jitter on top of a slow round trip.
        if let (Some(jitter), Some(rtt)) = (flow.jitter_ms, flow.rtt_ms) {
            if jitter > 50.0 && rtt > 300.0 {
                hits.push(RuleHit {
                    kind: "ddos",
                    score: 15,
                    detail: format!("jitter {jitter:.0} ms with rtt {rtt:.0} ms"),
                });
            }
        }

        // Suspicious names.
        for name in [flow.sni.as_deref(), flow.domain.as_deref()].into_iter().flatten() {
            let lower = name.to_lowercase();
            if let Some(pattern) = self
                .cfg
                .suspicious_patterns
                .iter()
                .find(|p| lower.contains(p.as_str()))
            {
                hits.push(RuleHit {
                    kind: "phishing",
                    score: 25,
                    detail: format!("{name} matches pattern {pattern:?}"),
                });
                break;
            }
        }

        // High-risk destination country, amplified by large uploads.
        if let Some(country) = flow.country.as_deref() {
            if self.cfg.high_risk_countries.iter().any(|c| c == country) {
                let score = if flow.bytes_out > 10 * 1024 * 1024 { 25 } else { 15 };
                hits.push(RuleHit {
                    kind: "exfiltration",
                    score,
                    detail: format!(
                        "{} bytes sent to high-risk country {country}",
                        flow.bytes_out
                    ),
                });
            }
        }

        // Something unidentifiable answering on a well-known port.
        if flow.application.is_none() && dpi::well_known_service(flow.dst_port).is_some() {
            hits.push(RuleHit {
                kind: "anomaly",
                score: 10,
                detail: format!("unrecognised traffic on well-known port {}", flow.dst_port),
            });
        }

        // DNS errors at a high rate.
        if let Some(rcode) = flow.dns_response_code.as_deref() {
            if rcode != "NOERROR" {
                let failures = self.dns_failures.record(src, now);
                if failures >= self.cfg.dns_failure_threshold {
                    hits.push(RuleHit {
                        kind: "anomaly",
                        score: 15,
                        detail: format!("{failures} DNS failures ({rcode}) from {src} within window"),
                    });
                }
            }
        }

        // Many RESET flows from the same source.
        if flow.connection_state == ConnectionState::Reset {
            let resets = self.rst_bursts.record(src, now);
            if resets >= self.cfg.rst_burst_threshold {
                hits.push(RuleHit {
                    kind: "scan",
                    score: 20,
                    detail: format!("{resets} RESET flows from {src} within window"),
                });
            }
        }

        self.build_threat(flow, hits)
    }

    fn build_threat(&self, flow: &FlowRecord, hits: Vec<RuleHit>) -> Option<Threat> {
        if hits.is_empty() {
            return None;
        }
        let score: i64 = hits.iter().map(|h| h.score).sum::<i64>().min(SCORE_CAP);
        let severity = Severity::classify(score)?;
        let top = hits.iter().max_by_key(|h| h.score)?;

        let mut evidence = BTreeMap::new();
        for (i, hit) in hits.iter().enumerate() {
            evidence.insert(format!("rule_{i}_{}", hit.kind), hit.detail.clone());
        }
        evidence.insert("score".to_string(), score.to_string());

        let description = format!("{}: {}", top.kind, top.detail);
        Some(Threat {
            id: Uuid::new_v4().to_string(),
            kind: top.kind.to_string(),
            severity,
            score,
            device_id: flow.device_id.clone(),
            flow_id: Some(flow.id.clone()),
            description,
            first_seen: flow.first_seen,
            last_seen: flow.last_seen,
            active: true,
            evidence,
        })
    }
}

//! Device registry: the set of endpoints observed on the monitored segment.
//!
//! The registry exclusively owns its in-memory map and is the only writer
//! of Device records. Ids are stable across restarts for the same
//! (ip, mac) pair. Inference (vendor, type, os) only ever fills empty
//! fields, so operator-supplied names, types and notes are never
//! overwritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::FlowRecord;
use crate::oui;

/// Derived connection quality, from RTT and retransmission behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(ConnectionQuality::Good),
            "fair" => Some(ConnectionQuality::Fair),
            "poor" => Some(ConnectionQuality::Poor),
            _ => None,
        }
    }

    fn demote(self) -> Self {
        match self {
            ConnectionQuality::Good => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// A known endpoint on the monitored segment, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub vendor: Option<String>,
    pub ip: String,
    pub mac: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_bytes: u64,
    pub connection_count: u64,
    pub threat_score: i64,
    pub notes: Option<String>,
    pub applications: BTreeSet<String>,
    pub os: Option<String>,
    pub ipv6_support: bool,
    pub avg_rtt: Option<f64>,
    pub connection_quality: Option<ConnectionQuality>,
    /// Open key/value bag for operator-supplied metadata.
    pub behavioural: BTreeMap<String, String>,
}

/// Operator-editable fields; applied via the external adapter and never
/// touched by inference afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub notes: Option<String>,
}

/// Stable device id for an (ip, mac) pair.
pub fn device_id(ip: IpAddr, mac: Option<&str>) -> String {
    let seed = format!("{}|{}", ip, mac.unwrap_or(""));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Quality grade: good < 100 ms, fair < 300 ms, poor otherwise; a
/// retransmission rate above 5 % demotes one level.
pub fn grade_quality(avg_rtt_ms: f64, retrans_rate: f64) -> ConnectionQuality {
    let base = if avg_rtt_ms < 100.0 {
        ConnectionQuality::Good
    } else if avg_rtt_ms < 300.0 {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    };
    if retrans_rate > 0.05 {
        base.demote()
    } else {
        base
    }
}

struct DeviceEntry {
    device: Device,
    rtt_samples: u64,
    retrans_total: u64,
    packets_total: u64,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from persisted devices so counters stay monotonic
    /// across restarts.
    pub fn preload(&self, devices: Vec<Device>) {
        let mut map = self.devices.lock().expect("device map lock");
        for device in devices {
            map.insert(
                device.id.clone(),
                DeviceEntry {
                    rtt_samples: u64::from(device.avg_rtt.is_some()),
                    retrans_total: 0,
                    packets_total: 0,
                    device,
                },
            );
        }
    }

    /// Fold a finalised flow into the device owning its source endpoint.
    /// Returns the updated record for persistence and notification.
    pub fn observe_flow(&self, flow: &FlowRecord, src_mac: Option<[u8; 6]>) -> Device {
        let mac_str = src_mac.map(|m| format_mac(&m));
        let id = device_id(flow.src_ip, mac_str.as_deref());
        let now = flow.last_seen;

        let mut map = self.devices.lock().expect("device map lock");
        let entry = map.entry(id.clone()).or_insert_with(|| DeviceEntry {
            device: Device {
                id: id.clone(),
                name: None,
                device_type: None,
                vendor: src_mac.as_ref().and_then(oui::lookup_bytes).map(str::to_string),
                ip: flow.src_ip.to_string(),
                mac: mac_str.clone(),
                first_seen: flow.first_seen,
                last_seen: flow.first_seen,
                total_bytes: 0,
                connection_count: 0,
                threat_score: 0,
                notes: None,
                applications: BTreeSet::new(),
                os: None,
                ipv6_support: false,
                avg_rtt: None,
                connection_quality: None,
                behavioural: BTreeMap::new(),
            },
            rtt_samples: 0,
            retrans_total: 0,
            packets_total: 0,
        });

        let device = &mut entry.device;
        if now > device.last_seen {
            device.last_seen = now;
        }
        device.total_bytes += flow.bytes_in + flow.bytes_out;
        device.connection_count += 1;
        if let Some(app) = &flow.application {
            device.applications.insert(app.clone());
        }
        if flow.src_ip.is_ipv6() {
            device.ipv6_support = true;
        }

        if let Some(rtt) = flow.rtt_ms {
            let prior = device.avg_rtt.unwrap_or(0.0) * entry.rtt_samples as f64;
            entry.rtt_samples += 1;
            device.avg_rtt = Some((prior + rtt) / entry.rtt_samples as f64);
        }
        entry.retrans_total += flow.retransmissions as u64;
        entry.packets_total += flow.packets_out;

        if let Some(avg_rtt) = device.avg_rtt {
            let rate = if entry.packets_total == 0 {
                0.0
            } else {
                entry.retrans_total as f64 / entry.packets_total as f64
            };
            device.connection_quality = Some(grade_quality(avg_rtt, rate));
        }

        // Inference fills only absent fields.
        if device.vendor.is_none() {
            device.vendor = src_mac.as_ref().and_then(oui::lookup_bytes).map(str::to_string);
        }
        if device.device_type.is_none() {
            device.device_type = infer_type(device.vendor.as_deref(), flow.ttl);
        }
        if device.os.is_none() {
            device.os = infer_os(flow.ttl);
        }

        device.clone()
    }

    /// Raise the device's threat score (kept at the historical maximum).
    pub fn record_threat(&self, id: &str, score: i64) -> Option<Device> {
        let mut map = self.devices.lock().expect("device map lock");
        let entry = map.get_mut(id)?;
        if score > entry.device.threat_score {
            entry.device.threat_score = score;
        }
        Some(entry.device.clone())
    }

    /// Apply an operator patch. Patched fields win permanently because
    /// inference never overwrites a set field.
    pub fn apply_patch(&self, id: &str, patch: DevicePatch) -> Option<Device> {
        let mut map = self.devices.lock().expect("device map lock");
        let entry = map.get_mut(id)?;
        if let Some(name) = patch.name {
            entry.device.name = Some(name);
        }
        if let Some(device_type) = patch.device_type {
            entry.device.device_type = Some(device_type);
        }
        if let Some(notes) = patch.notes {
            entry.device.notes = Some(notes);
        }
        Some(entry.device.clone())
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices
            .lock()
            .expect("device map lock")
            .get(id)
            .map(|e| e.device.clone())
    }

    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .lock()
            .expect("device map lock")
            .values()
            .map(|e| e.device.clone())
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }

    pub fn count(&self) -> usize {
        self.devices.lock().expect("device map lock").len()
    }
}

fn infer_type(vendor: Option<&str>, ttl: Option<u8>) -> Option<String> {
    if let Some(vendor) = vendor {
        let v = vendor.to_lowercase();
        let inferred = if v.contains("ubiquiti")
            || v.contains("cisco")
            || v.contains("routerboard")
            || v.contains("tp-link")
            || v.contains("netgear")
            || v.contains("zyxel")
            || v.contains("fortinet")
        {
            Some("router")
        } else if v.contains("espressif")
            || v.contains("tuya")
            || v.contains("sonos")
            || v.contains("philips")
        {
            Some("iot")
        } else if v.contains("raspberry") || v.contains("synology") || v.contains("super micro") {
            Some("server")
        } else if v.contains("nintendo") || v.contains("sony interactive") {
            Some("gaming")
        } else if v.contains("roku") {
            Some("tv")
        } else {
            None
        };
        if inferred.is_some() {
            return inferred.map(str::to_string);
        }
    }
    // TTL 255 senders are almost always network gear.
    if matches!(ttl, Some(248..=255)) {
        return Some("router".to_string());
    }
    None
}

fn infer_os(ttl: Option<u8>) -> Option<String> {
    match ttl {
        // Initial TTL 128 within a couple of hops.
        Some(121..=128) => Some("Windows".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ConnectionState, FlowStatus};

    fn flow(src: &str, bytes_out: u64, rtt: Option<f64>, retrans: u32) -> FlowRecord {
        let now = Utc::now();
        FlowRecord {
            id: Uuid::new_v4().to_string(),
            device_id: None,
            src_ip: src.parse().unwrap(),
            src_port: 50000,
            dst_ip: "93.184.216.34".parse().unwrap(),
            dst_port: 443,
            protocol: "TCP".to_string(),
            bytes_in: 1000,
            bytes_out,
            packets_in: 10,
            packets_out: 100,
            first_seen: now,
            last_seen: now,
            duration_ms: 0,
            status: FlowStatus::Closed,
            domain: None,
            sni: None,
            application: Some("HTTPS".to_string()),
            http_method: None,
            url: None,
            user_agent: None,
            dns_query_type: None,
            dns_response_code: None,
            country: None,
            city: None,
            asn: None,
            tcp_flags: 0,
            ttl: Some(64),
            connection_state: ConnectionState::Closed,
            rtt_ms: rtt,
            jitter_ms: None,
            retransmissions: retrans,
            threat_level: None,
        }
    }

    const PI_MAC: [u8; 6] = [0xB8, 0x27, 0xEB, 0x01, 0x02, 0x03];

    #[test]
    fn id_is_stable_for_ip_mac_pair() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let a = device_id(ip, Some("b8:27:eb:01:02:03"));
        let b = device_id(ip, Some("b8:27:eb:01:02:03"));
        assert_eq!(a, b);
        assert_ne!(a, device_id(ip, Some("b8:27:eb:01:02:04")));
        assert_ne!(a, device_id("10.0.0.6".parse().unwrap(), Some("b8:27:eb:01:02:03")));
    }

    #[test]
    fn observe_creates_and_accumulates() {
        let registry = DeviceRegistry::new();
        let d1 = registry.observe_flow(&flow("10.0.0.5", 5_000, Some(40.0), 0), Some(PI_MAC));
        assert_eq!(d1.connection_count, 1);
        assert_eq!(d1.total_bytes, 6_000);
        assert_eq!(d1.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(d1.device_type.as_deref(), Some("server"));
        assert!(d1.applications.contains("HTTPS"));

        let d2 = registry.observe_flow(&flow("10.0.0.5", 4_000, Some(60.0), 0), Some(PI_MAC));
        assert_eq!(d2.id, d1.id);
        assert_eq!(d2.connection_count, 2);
        assert_eq!(d2.total_bytes, 11_000);
        let avg = d2.avg_rtt.unwrap();
        assert!((avg - 50.0).abs() < 0.01, "running mean, got {avg}");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn quality_thresholds() {
        assert_eq!(grade_quality(50.0, 0.0), ConnectionQuality::Good);
        assert_eq!(grade_quality(150.0, 0.0), ConnectionQuality::Fair);
        assert_eq!(grade_quality(400.0, 0.0), ConnectionQuality::Poor);
        // Retransmission rate above 5% demotes one level.
        assert_eq!(grade_quality(50.0, 0.06), ConnectionQuality::Fair);
        assert_eq!(grade_quality(150.0, 0.06), ConnectionQuality::Poor);
        assert_eq!(grade_quality(400.0, 0.50), ConnectionQuality::Poor);
    }

    #[test]
    fn retransmissions_demote_quality() {
        let registry = DeviceRegistry::new();
        // 12 retransmissions over 100 outbound packets with a fast RTT:
        // good demoted to fair.
        let d = registry.observe_flow(&flow("10.0.0.5", 1_000, Some(20.0), 12), Some(PI_MAC));
        assert_eq!(d.connection_quality, Some(ConnectionQuality::Fair));
    }

    #[test]
    fn patch_wins_over_inference() {
        let registry = DeviceRegistry::new();
        let d = registry.observe_flow(&flow("10.0.0.5", 100, None, 0), Some(PI_MAC));
        assert_eq!(d.device_type.as_deref(), Some("server"));

        let patched = registry
            .apply_patch(
                &d.id,
                DevicePatch {
                    name: Some("kitchen-pi".to_string()),
                    device_type: Some("iot".to_string()),
                    notes: Some("under the counter".to_string()),
                },
            )
            .expect("device exists");
        assert_eq!(patched.name.as_deref(), Some("kitchen-pi"));
        assert_eq!(patched.device_type.as_deref(), Some("iot"));

        // Later traffic must not undo the operator's choice.
        let after = registry.observe_flow(&flow("10.0.0.5", 100, None, 0), Some(PI_MAC));
        assert_eq!(after.device_type.as_deref(), Some("iot"));
        assert_eq!(after.name.as_deref(), Some("kitchen-pi"));
        assert_eq!(after.notes.as_deref(), Some("under the counter"));
    }

    #[test]
    fn patch_unknown_device_is_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.apply_patch("nope", DevicePatch::default()).is_none());
    }

    #[test]
    fn threat_score_keeps_maximum() {
        let registry = DeviceRegistry::new();
        let d = registry.observe_flow(&flow("10.0.0.5", 100, None, 0), Some(PI_MAC));
        registry.record_threat(&d.id, 40);
        registry.record_threat(&d.id, 25);
        assert_eq!(registry.get(&d.id).unwrap().threat_score, 40);
    }

    #[test]
    fn ipv6_source_marks_support() {
        let registry = DeviceRegistry::new();
        let d = registry.observe_flow(&flow("2001:db8::5", 100, None, 0), None);
        assert!(d.ipv6_support);
    }

    #[test]
    fn preload_keeps_counters_monotonic() {
        let registry = DeviceRegistry::new();
        let d = registry.observe_flow(&flow("10.0.0.5", 1_000, None, 0), Some(PI_MAC));

        let other = DeviceRegistry::new();
        other.preload(vec![d.clone()]);
        let after = other.observe_flow(&flow("10.0.0.5", 1_000, None, 0), Some(PI_MAC));
        assert_eq!(after.connection_count, d.connection_count + 1);
        assert!(after.total_bytes > d.total_bytes);
    }
}

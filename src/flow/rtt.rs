//! Per-flow timing side-tables: RTT sampling and retransmission detection.
//!
//! Both trackers own their own lock, are bounded, and evict the
//! longest-untouched entry when full. Entries are removed (not just read)
//! at flow finalisation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{Direction, FlowKey};

const RTT_SAMPLE_WINDOW: usize = 10;
const SEQ_WINDOW_PER_FLOW: usize = 4096;

/// SYN→ACK round-trip sampling, windowed per flow.
pub struct RttTracker {
    inner: Mutex<HashMap<FlowKey, RttEntry>>,
    cap: usize,
}

struct RttEntry {
    /// Outstanding SYN timestamp awaiting the first ACK-bearing reply.
    syn_at: Option<DateTime<Utc>>,
    samples: VecDeque<f64>,
    last_touch: DateTime<Utc>,
}

impl RttTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// A SYN-bearing packet left in the forward direction.
    pub fn observe_syn(&self, key: &FlowKey, at: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("rtt lock");
        if !map.contains_key(key) && map.len() >= self.cap {
            evict_oldest(&mut map, |e| e.last_touch);
        }
        let entry = map.entry(key.clone()).or_insert_with(|| RttEntry {
            syn_at: None,
            samples: VecDeque::new(),
            last_touch: at,
        });
        if entry.syn_at.is_none() {
            entry.syn_at = Some(at);
        }
        entry.last_touch = at;
    }

    /// An ACK-bearing reply arrived; closes the outstanding SYN sample.
    pub fn observe_ack(&self, key: &FlowKey, at: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("rtt lock");
        let Some(entry) = map.get_mut(key) else {
            return;
        };
        if let Some(syn_at) = entry.syn_at.take() {
            let rtt_ms = (at - syn_at).num_microseconds().unwrap_or(0) as f64 / 1000.0;
            if rtt_ms >= 0.0 {
                entry.samples.push_back(rtt_ms);
                while entry.samples.len() > RTT_SAMPLE_WINDOW {
                    entry.samples.pop_front();
                }
            }
        }
        entry.last_touch = at;
    }

    /// Remove the entry and return the mean of its samples.
    pub fn take_mean(&self, key: &FlowKey) -> Option<f64> {
        let entry = self.inner.lock().expect("rtt lock").remove(key)?;
        if entry.samples.is_empty() {
            return None;
        }
        Some(entry.samples.iter().sum::<f64>() / entry.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("rtt lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Repeated-sequence-number detection, per flow direction.
pub struct RetransTracker {
    inner: Mutex<HashMap<FlowKey, SeqEntry>>,
    cap: usize,
}

struct SeqEntry {
    seen_out: HashSet<u32>,
    seen_in: HashSet<u32>,
    order_out: VecDeque<u32>,
    order_in: VecDeque<u32>,
    retransmissions: u32,
    last_touch: DateTime<Utc>,
}

impl RetransTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Record a data-bearing segment; returns true when the sequence number
    /// was already seen in this direction.
    pub fn observe(&self, key: &FlowKey, direction: Direction, seq: u32, at: DateTime<Utc>) -> bool {
        let mut map = self.inner.lock().expect("retrans lock");
        if !map.contains_key(key) && map.len() >= self.cap {
            evict_oldest(&mut map, |e| e.last_touch);
        }
        let entry = map.entry(key.clone()).or_insert_with(|| SeqEntry {
            seen_out: HashSet::new(),
            seen_in: HashSet::new(),
            order_out: VecDeque::new(),
            order_in: VecDeque::new(),
            retransmissions: 0,
            last_touch: at,
        });
        entry.last_touch = at;

        let (seen, order) = match direction {
            Direction::Out => (&mut entry.seen_out, &mut entry.order_out),
            Direction::In => (&mut entry.seen_in, &mut entry.order_in),
        };
        if seen.contains(&seq) {
            entry.retransmissions += 1;
            return true;
        }
        seen.insert(seq);
        order.push_back(seq);
        while order.len() > SEQ_WINDOW_PER_FLOW {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
        false
    }

    /// Remove the entry and return its retransmission count.
    pub fn take_count(&self, key: &FlowKey) -> u32 {
        self.inner
            .lock()
            .expect("retrans lock")
            .remove(key)
            .map(|e| e.retransmissions)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("retrans lock").len()
    }
}

fn evict_oldest<V>(map: &mut HashMap<FlowKey, V>, touch: impl Fn(&V) -> DateTime<Utc>) {
    if let Some(oldest) = map
        .iter()
        .min_by_key(|(_, v)| touch(v))
        .map(|(k, _)| k.clone())
    {
        map.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Transport;
    use chrono::Duration;
    use std::net::IpAddr;

    fn key(n: u8) -> FlowKey {
        FlowKey {
            src_addr: IpAddr::from([10, 0, 0, n]),
            src_port: 40000 + n as u16,
            dst_addr: IpAddr::from([10, 0, 0, 200]),
            dst_port: 443,
            transport: Transport::Tcp,
        }
    }

    #[test]
    fn syn_ack_pair_yields_sample() {
        let tracker = RttTracker::new(16);
        let t0 = Utc::now();
        let k = key(1);
        tracker.observe_syn(&k, t0);
        tracker.observe_ack(&k, t0 + Duration::milliseconds(42));

        let mean = tracker.take_mean(&k).expect("one sample");
        assert!((mean - 42.0).abs() < 1.0, "mean {mean}");
        // Removed on take.
        assert!(tracker.take_mean(&k).is_none());
    }

    #[test]
    fn ack_without_syn_is_noop() {
        let tracker = RttTracker::new(16);
        tracker.observe_ack(&key(1), Utc::now());
        assert!(tracker.take_mean(&key(1)).is_none());
    }

    #[test]
    fn rtt_cap_evicts_oldest() {
        let tracker = RttTracker::new(2);
        let t0 = Utc::now();
        tracker.observe_syn(&key(1), t0);
        tracker.observe_syn(&key(2), t0 + Duration::milliseconds(1));
        tracker.observe_syn(&key(3), t0 + Duration::milliseconds(2));
        assert_eq!(tracker.len(), 2);
        // key(1) was oldest and fell out.
        tracker.observe_ack(&key(1), t0 + Duration::milliseconds(10));
        assert!(tracker.take_mean(&key(1)).is_none());
    }

    #[test]
    fn repeated_seq_counts_per_direction() {
        let tracker = RetransTracker::new(16);
        let now = Utc::now();
        let k = key(1);

        assert!(!tracker.observe(&k, Direction::Out, 1000, now));
        assert!(tracker.observe(&k, Direction::Out, 1000, now));
        // Same seq in the other direction is not a retransmission.
        assert!(!tracker.observe(&k, Direction::In, 1000, now));

        assert_eq!(tracker.take_count(&k), 1);
        assert_eq!(tracker.take_count(&k), 0);
    }

    #[test]
    fn retrans_cap_evicts_oldest() {
        let tracker = RetransTracker::new(2);
        let t0 = Utc::now();
        tracker.observe(&key(1), Direction::Out, 1, t0);
        tracker.observe(&key(2), Direction::Out, 1, t0 + Duration::milliseconds(1));
        tracker.observe(&key(3), Direction::Out, 1, t0 + Duration::milliseconds(2));
        assert_eq!(tracker.len(), 2);
    }
}

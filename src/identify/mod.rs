//! Peer identification: observed DNS answers, reverse DNS, TLS SNI/ALPN,
//! HTTP metadata, banner fingerprints and protocol signatures.
//!
//! Display-name priority, highest first: observed DNS answer, HTTP Host
//! header, TLS SNI, reverse DNS. Extractors return `None` on malformed
//! input; reverse DNS runs only at flow finalisation, never on the ingest
//! path.

pub mod dns;
pub mod dpi;
pub mod http;
pub mod tls;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::config::IdentifyConfig;

pub use http::HttpRequest;

/// What a single DNS packet contributed: per-flow fields for the DNS flow
/// itself, plus answer-address mappings recorded in the cache.
#[derive(Debug, Clone, Default)]
pub struct DnsObservation {
    pub query_name: Option<String>,
    pub query_type: Option<&'static str>,
    /// Only set on responses.
    pub response_code: Option<&'static str>,
    pub is_response: bool,
}

/// Bounded FIFO cache of observed answer address → query name.
struct DnsNameCache {
    map: HashMap<IpAddr, String>,
    order: VecDeque<IpAddr>,
    cap: usize,
}

impl DnsNameCache {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn insert(&mut self, addr: IpAddr, name: String) {
        if self.map.insert(addr, name).is_none() {
            self.order.push_back(addr);
            while self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, addr: &IpAddr) -> Option<String> {
        self.map.get(addr).cloned()
    }
}

pub struct Identifier {
    cfg: IdentifyConfig,
    dns_cache: Mutex<DnsNameCache>,
    /// Positive and negative reverse-DNS results, cached for the process
    /// lifetime.
    rdns_cache: DashMap<IpAddr, Option<String>>,
    resolver: Option<TokioAsyncResolver>,
}

impl Identifier {
    pub fn new(cfg: IdentifyConfig) -> Self {
        let resolver = if cfg.enable_reverse_dns {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(error = %e, "Failed to load system DNS config; reverse DNS disabled");
                    None
                }
            }
        } else {
            None
        };
        let dns_cache = Mutex::new(DnsNameCache::new(cfg.dns_cache_size));
        Self {
            cfg,
            dns_cache,
            rdns_cache: DashMap::new(),
            resolver,
        }
    }

    /// Inspect a UDP payload on port 53/5353. Responses feed the
    /// answer-address cache; both directions contribute per-flow DNS fields.
    pub fn observe_dns(&self, payload: &[u8], src_port: u16, dst_port: u16) -> Option<DnsObservation> {
        if !self.cfg.enable_dns_tracking {
            return None;
        }
        let dns_port = |p: u16| p == 53 || p == 5353;
        if !dns_port(src_port) && !dns_port(dst_port) {
            return None;
        }
        let msg = dns::parse(payload)?;

        let obs = DnsObservation {
            query_name: msg.query_name.clone(),
            query_type: msg.query_type.map(dns::qtype_str),
            response_code: msg.is_response.then(|| dns::rcode_str(msg.response_code)),
            is_response: msg.is_response,
        };

        if msg.is_response {
            if let Some(name) = msg.query_name {
                let mut cache = self.dns_cache.lock().expect("dns cache lock");
                for addr in msg.addresses {
                    cache.insert(addr, name.clone());
                }
            }
        }
        Some(obs)
    }

    /// Name from an observed DNS answer, if any.
    pub fn dns_name(&self, addr: IpAddr) -> Option<String> {
        self.dns_cache.lock().expect("dns cache lock").get(&addr)
    }

    /// Reverse-DNS resolve with the configured timeout and retry budget.
    /// Positive and negative results are both cached.
    pub async fn reverse_dns(&self, addr: IpAddr) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        if let Some(hit) = self.rdns_cache.get(&addr) {
            return hit.clone();
        }

        let timeout = Duration::from_millis(self.cfg.reverse_dns_timeout_ms);
        let mut result = None;
        for attempt in 0..=self.cfg.reverse_dns_retries {
            match tokio::time::timeout(timeout, resolver.reverse_lookup(addr)).await {
                Ok(Ok(lookup)) => {
                    result = lookup.iter().next().map(|name| {
                        // Strip the trailing FQDN dot.
                        name.to_string().trim_end_matches('.').to_string()
                    });
                    break;
                }
                Ok(Err(e)) => {
                    debug!(ip = %addr, attempt, error = %e, "Reverse DNS lookup failed");
                    break; // NXDOMAIN and friends will not improve on retry
                }
                Err(_) => {
                    debug!(ip = %addr, attempt, "Reverse DNS lookup timed out");
                }
            }
        }

        // The resolver echoing the address back is not a name.
        if result.as_deref() == Some(&addr.to_string()) {
            result = None;
        }

        self.rdns_cache.insert(addr, result.clone());
        result
    }

    /// Best available name for a remote peer, in priority order:
    /// observed DNS answer > HTTP Host > SNI > reverse DNS.
    pub async fn resolve_name(
        &self,
        addr: IpAddr,
        http_host: Option<&str>,
        sni: Option<&str>,
    ) -> Option<String> {
        if let Some(name) = self.dns_name(addr) {
            return Some(name);
        }
        if let Some(host) = http_host {
            return Some(host.to_string());
        }
        if let Some(name) = sni {
            return Some(name.to_string());
        }
        self.reverse_dns(addr).await
    }

    pub fn extract_sni(&self, payload: &[u8]) -> Option<String> {
        if !self.cfg.enable_sni {
            return None;
        }
        tls::extract_sni(payload)
    }

    pub fn extract_alpn(&self, payload: &[u8]) -> Option<String> {
        if !self.cfg.enable_alpn {
            return None;
        }
        tls::extract_alpn(payload)
    }

    pub fn extract_http(&self, payload: &[u8]) -> Option<HttpRequest> {
        http::extract(payload)
    }

    pub fn fingerprint_banner(&self, payload: &[u8], port: u16) -> Option<&'static str> {
        if !self.cfg.enable_fingerprint {
            return None;
        }
        dpi::fingerprint_banner(payload, port)
    }

    pub fn classify_dpi(&self, payload: &[u8], port: u16) -> Option<&'static str> {
        if !self.cfg.enable_dpi {
            return None;
        }
        dpi::classify_signature(payload, port)
    }

    /// Choose the application label for a finalised flow.
    ///
    /// Priority: banner/DPI observation, then ALPN, then the well-known
    /// port table; bare TLS on an unknown port labels as TLS.
    pub fn application(
        &self,
        observed: Option<&str>,
        alpn: Option<&str>,
        tls_seen: bool,
        server_port: u16,
    ) -> Option<String> {
        if let Some(app) = observed {
            return Some(app.to_string());
        }
        if let Some(app) = alpn.and_then(dpi::alpn_application) {
            return Some(app.to_string());
        }
        if let Some(app) = dpi::well_known_service(server_port) {
            return Some(app.to_string());
        }
        tls_seen.then(|| "TLS".to_string())
    }
}

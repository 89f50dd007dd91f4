use anyhow::Result;
use serde::Deserialize;

/// Application configuration loaded from a TOML file or defaults.
///
/// Every knob has a serde default so a partial (or absent) file is fine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub identify: IdentifyConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub geo: GeoConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Packet capture and flow aggregation knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// OS interface to open in promiscuous mode.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Kernel-level BPF filter expression.
    #[serde(default = "default_bpf_filter")]
    pub bpf_filter: String,

    /// Fraction of packets accepted, in (0, 1]. 1.0 disables sampling.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Capacity of the capture-thread → aggregator channel.
    #[serde(default = "default_packet_queue_size")]
    pub packet_queue_size: usize,

    /// Cap on concurrently tracked flows; oldest-idle are force-finalised.
    #[serde(default = "default_max_active_flows")]
    pub max_active_flows: usize,

    /// A flow with no packets for this long is finalised.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_rtt_tracker_size")]
    pub rtt_tracker_size: usize,

    #[serde(default = "default_retrans_tracker_size")]
    pub retrans_tracker_size: usize,
}

/// Switches and budgets for the peer-identification extractors.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyConfig {
    #[serde(default = "default_true")]
    pub enable_dns_tracking: bool,

    #[serde(default = "default_true")]
    pub enable_reverse_dns: bool,

    #[serde(default = "default_true")]
    pub enable_dpi: bool,

    #[serde(default = "default_true")]
    pub enable_fingerprint: bool,

    #[serde(default = "default_true")]
    pub enable_sni: bool,

    #[serde(default = "default_true")]
    pub enable_alpn: bool,

    /// Bound on the observed DNS answer → name cache.
    #[serde(default = "default_dns_cache_size")]
    pub dns_cache_size: usize,

    #[serde(default = "default_reverse_dns_timeout_ms")]
    pub reverse_dns_timeout_ms: u64,

    #[serde(default = "default_reverse_dns_retries")]
    pub reverse_dns_retries: u32,
}

/// SQLite tuning and write batching.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Flows buffered before a batch insert is forced.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum age of a buffered flow before the batch is flushed anyway.
    #[serde(default = "default_batch_interval_secs")]
    pub batch_interval_secs: u64,

    /// SQLite page cache, in KiB.
    #[serde(default = "default_page_cache_kb")]
    pub page_cache_kb: u64,

    /// Memory-mapped I/O window, in bytes.
    #[serde(default = "default_mmap_size_bytes")]
    pub mmap_size_bytes: u64,

    /// Write retries before a storage error surfaces.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Flows and threats older than this are deleted by periodic cleanup.
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u64,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Per-subscriber bounded queue; oldest messages drop on overflow.
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    /// How many recently finalised flows the initial snapshot carries.
    #[serde(default = "default_initial_flows_limit")]
    pub initial_flows_limit: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoConfig {
    /// MaxMind-format database path. Absent file is non-fatal.
    #[serde(default)]
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of the human format.
    #[serde(default)]
    pub structured: bool,
}

fn default_interface() -> String {
    "eth0".into()
}

fn default_bpf_filter() -> String {
    "ip or ip6".into()
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_packet_queue_size() -> usize {
    2048
}

fn default_max_active_flows() -> usize {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_rtt_tracker_size() -> usize {
    5_000
}

fn default_retrans_tracker_size() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_dns_cache_size() -> usize {
    1_000
}

fn default_reverse_dns_timeout_ms() -> u64 {
    2_000
}

fn default_reverse_dns_retries() -> u32 {
    1
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_interval_secs() -> u64 {
    5
}

fn default_page_cache_kb() -> u64 {
    8_192
}

fn default_mmap_size_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_data_retention_days() -> u64 {
    30
}

fn default_cleanup_interval_hours() -> u64 {
    1
}

fn default_subscriber_queue_size() -> usize {
    256
}

fn default_initial_flows_limit() -> usize {
    100
}

fn default_log_level() -> String {
    "netinsight=info".into()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bpf_filter: default_bpf_filter(),
            sampling_rate: default_sampling_rate(),
            packet_queue_size: default_packet_queue_size(),
            max_active_flows: default_max_active_flows(),
            idle_timeout_secs: default_idle_timeout_secs(),
            rtt_tracker_size: default_rtt_tracker_size(),
            retrans_tracker_size: default_retrans_tracker_size(),
        }
    }
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            enable_dns_tracking: true,
            enable_reverse_dns: true,
            enable_dpi: true,
            enable_fingerprint: true,
            enable_sni: true,
            enable_alpn: true,
            dns_cache_size: default_dns_cache_size(),
            reverse_dns_timeout_ms: default_reverse_dns_timeout_ms(),
            reverse_dns_retries: default_reverse_dns_retries(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_secs: default_batch_interval_secs(),
            page_cache_kb: default_page_cache_kb(),
            mmap_size_bytes: default_mmap_size_bytes(),
            retry_limit: default_retry_limit(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            data_retention_days: default_data_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_size: default_subscriber_queue_size(),
            initial_flows_limit: default_initial_flows_limit(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            structured: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.capture.max_active_flows, 10_000);
        assert_eq!(cfg.capture.idle_timeout_secs, 60);
        assert_eq!(cfg.capture.packet_queue_size, 2048);
        assert_eq!(cfg.storage.batch_size, 50);
        assert_eq!(cfg.notify.subscriber_queue_size, 256);
        assert_eq!(cfg.retention.data_retention_days, 30);
        assert!((cfg.capture.sampling_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::de::from_str(
            r#"
            [capture]
            interface = "enp3s0"
            sampling_rate = 0.5

            [retention]
            data_retention_days = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.capture.interface, "enp3s0");
        assert!((cfg.capture.sampling_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.capture.bpf_filter, "ip or ip6");
        assert_eq!(cfg.retention.data_retention_days, 7);
        assert_eq!(cfg.retention.cleanup_interval_hours, 1);
        assert!(cfg.identify.enable_sni);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg: AppConfig = toml::de::from_str("").unwrap();
        assert_eq!(cfg.capture.interface, "eth0");
        assert!(cfg.geo.database_path.is_none());
        assert!(!cfg.log.structured);
    }
}

//! Read-side analytics over the store: the surface a thin HTTP adapter
//! maps 1:1 onto routes. Everything here is SQL over the indexed tables;
//! nothing mutates.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::error::StoreError;
use crate::flow::FlowRecord;
use crate::store::{FlowQuery, Store};

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub devices: i64,
    pub flows: i64,
    pub active_threats: i64,
    pub total_bytes: i64,
    pub flows_last_hour: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountryStat {
    pub country: String,
    pub flows: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStat {
    pub domain: String,
    pub flows: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceTrafficStat {
    pub device_id: String,
    pub name: Option<String>,
    pub ip: String,
    pub bytes: i64,
    pub flows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthBucket {
    pub bucket: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendBucket {
    pub bucket: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountBucket {
    pub bucket: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityStat {
    pub quality: String,
    pub devices: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStat {
    pub application: String,
    pub flows: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationTrendBucket {
    pub application: String,
    pub bucket: String,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceAnalytics {
    pub device_id: String,
    pub flows: i64,
    pub total_bytes: i64,
    pub avg_rtt: Option<f64>,
    pub top_domains: Vec<DomainStat>,
    pub applications: Vec<ApplicationStat>,
}

fn window_start(hours: i64) -> String {
    (Utc::now() - Duration::hours(hours.max(1))).to_rfc3339()
}

impl Store {
    pub async fn summary(&self) -> Result<Summary, StoreError> {
        let pool = self.pool().await;
        let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&pool)
            .await?;
        let flows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(&pool)
            .await?;
        let active_threats: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM threats WHERE active = 1")
                .fetch_one(&pool)
                .await?;
        let total_bytes: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(bytes_in + bytes_out), 0) FROM flows",
        )
        .fetch_one(&pool)
        .await?;
        let flows_last_hour: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM flows WHERE last_seen >= ?")
                .bind(window_start(1))
                .fetch_one(&pool)
                .await?;
        Ok(Summary {
            devices,
            flows,
            active_threats,
            total_bytes,
            flows_last_hour,
        })
    }

    pub async fn geographic(&self, hours: i64) -> Result<Vec<CountryStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT country, COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE country IS NOT NULL AND last_seen >= ?
               GROUP BY country
               ORDER BY bytes DESC"#,
        )
        .bind(window_start(hours))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| CountryStat {
                country: r.get("country"),
                flows: r.get("flows"),
                bytes: r.get("bytes"),
            })
            .collect())
    }

    pub async fn top_domains(&self, hours: i64, limit: i64) -> Result<Vec<DomainStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT domain, COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE domain IS NOT NULL AND last_seen >= ?
               GROUP BY domain
               ORDER BY bytes DESC
               LIMIT ?"#,
        )
        .bind(window_start(hours))
        .bind(limit.clamp(1, 500))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| DomainStat {
                domain: r.get("domain"),
                flows: r.get("flows"),
                bytes: r.get("bytes"),
            })
            .collect())
    }

    pub async fn top_devices(
        &self,
        hours: i64,
        limit: i64,
    ) -> Result<Vec<DeviceTrafficStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT f.device_id, d.name, d.ip,
                      COALESCE(SUM(f.bytes_in + f.bytes_out), 0) AS bytes,
                      COUNT(*) AS flows
               FROM flows f
               JOIN devices d ON d.id = f.device_id
               WHERE f.device_id IS NOT NULL AND f.last_seen >= ?
               GROUP BY f.device_id
               ORDER BY bytes DESC
               LIMIT ?"#,
        )
        .bind(window_start(hours))
        .bind(limit.clamp(1, 500))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| DeviceTrafficStat {
                device_id: r.get("device_id"),
                name: r.get("name"),
                ip: r.get("ip"),
                bytes: r.get("bytes"),
                flows: r.get("flows"),
            })
            .collect())
    }

    /// Per-hour traffic totals over the window.
    pub async fn bandwidth(&self, hours: i64) -> Result<Vec<BandwidthBucket>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT strftime('%Y-%m-%dT%H:00', last_seen) AS bucket,
                      COALESCE(SUM(bytes_in), 0) AS bytes_in,
                      COALESCE(SUM(bytes_out), 0) AS bytes_out
               FROM flows
               WHERE last_seen >= ?
               GROUP BY bucket
               ORDER BY bucket ASC"#,
        )
        .bind(window_start(hours))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| BandwidthBucket {
                bucket: r.get("bucket"),
                bytes_in: r.get("bytes_in"),
                bytes_out: r.get("bytes_out"),
            })
            .collect())
    }

    pub async fn rtt_trends(&self, hours: i64) -> Result<Vec<TrendBucket>, StoreError> {
        self.hourly_average("rtt", hours).await
    }

    pub async fn jitter_trends(&self, hours: i64) -> Result<Vec<TrendBucket>, StoreError> {
        self.hourly_average("jitter", hours).await
    }

    async fn hourly_average(
        &self,
        column: &'static str,
        hours: i64,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        let pool = self.pool().await;
        // `column` is a compile-time constant, never user input.
        let sql = format!(
            "SELECT strftime('%Y-%m-%dT%H:00', last_seen) AS bucket, AVG({column}) AS value \
             FROM flows WHERE {column} IS NOT NULL AND last_seen >= ? \
             GROUP BY bucket ORDER BY bucket ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(window_start(hours))
            .fetch_all(&pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TrendBucket {
                bucket: r.get("bucket"),
                value: r.get::<Option<f64>, _>("value").unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn retransmission_trends(&self, hours: i64) -> Result<Vec<CountBucket>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT strftime('%Y-%m-%dT%H:00', last_seen) AS bucket,
                      COALESCE(SUM(retransmissions), 0) AS count
               FROM flows
               WHERE last_seen >= ?
               GROUP BY bucket
               ORDER BY bucket ASC"#,
        )
        .bind(window_start(hours))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| CountBucket {
                bucket: r.get("bucket"),
                count: r.get("count"),
            })
            .collect())
    }

    pub async fn connection_quality_distribution(&self) -> Result<Vec<QualityStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT connection_quality AS quality, COUNT(*) AS devices
               FROM devices
               WHERE connection_quality IS NOT NULL
               GROUP BY connection_quality
               ORDER BY devices DESC"#,
        )
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| QualityStat {
                quality: r.get("quality"),
                devices: r.get("devices"),
            })
            .collect())
    }

    pub async fn applications(&self, hours: i64) -> Result<Vec<ApplicationStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT application, COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE application IS NOT NULL AND last_seen >= ?
               GROUP BY application
               ORDER BY bytes DESC"#,
        )
        .bind(window_start(hours))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ApplicationStat {
                application: r.get("application"),
                flows: r.get("flows"),
                bytes: r.get("bytes"),
            })
            .collect())
    }

    pub async fn application_trends(
        &self,
        hours: i64,
    ) -> Result<Vec<ApplicationTrendBucket>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT application, strftime('%Y-%m-%dT%H:00', last_seen) AS bucket,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE application IS NOT NULL AND last_seen >= ?
               GROUP BY application, bucket
               ORDER BY bucket ASC, bytes DESC"#,
        )
        .bind(window_start(hours))
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ApplicationTrendBucket {
                application: r.get("application"),
                bucket: r.get("bucket"),
                bytes: r.get("bytes"),
            })
            .collect())
    }

    pub async fn device_application_profile(
        &self,
        device_id: &str,
    ) -> Result<Vec<ApplicationStat>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"SELECT application, COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE device_id = ? AND application IS NOT NULL
               GROUP BY application
               ORDER BY bytes DESC"#,
        )
        .bind(device_id)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ApplicationStat {
                application: r.get("application"),
                flows: r.get("flows"),
                bytes: r.get("bytes"),
            })
            .collect())
    }

    pub async fn device_analytics(
        &self,
        device_id: &str,
        hours: i64,
    ) -> Result<DeviceAnalytics, StoreError> {
        // 404 for unknown devices, like every other device read.
        self.get_device(device_id).await?;

        let pool = self.pool().await;
        let start = window_start(hours);
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS total_bytes,
                      AVG(rtt) AS avg_rtt
               FROM flows
               WHERE device_id = ? AND last_seen >= ?"#,
        )
        .bind(device_id)
        .bind(&start)
        .fetch_one(&pool)
        .await?;

        let domains = sqlx::query(
            r#"SELECT domain, COUNT(*) AS flows,
                      COALESCE(SUM(bytes_in + bytes_out), 0) AS bytes
               FROM flows
               WHERE device_id = ? AND domain IS NOT NULL AND last_seen >= ?
               GROUP BY domain ORDER BY bytes DESC LIMIT 10"#,
        )
        .bind(device_id)
        .bind(&start)
        .fetch_all(&pool)
        .await?;

        let applications = self.device_application_profile(device_id).await?;

        Ok(DeviceAnalytics {
            device_id: device_id.to_string(),
            flows: row.get("flows"),
            total_bytes: row.get("total_bytes"),
            avg_rtt: row.get("avg_rtt"),
            top_domains: domains
                .iter()
                .map(|r| DomainStat {
                    domain: r.get("domain"),
                    flows: r.get("flows"),
                    bytes: r.get("bytes"),
                })
                .collect(),
            applications,
        })
    }

    /// Serialise the flows matching `query` as `json` or `csv`.
    pub async fn export_flows(
        &self,
        format: &str,
        query: &FlowQuery,
    ) -> Result<String, StoreError> {
        let flows = self.query_flows(query).await?;
        match format {
            "json" => serde_json::to_string_pretty(&flows)
                .map_err(|e| StoreError::InvalidArgument(format!("serialisation failed: {e}"))),
            "csv" => Ok(flows_to_csv(&flows)),
            other => Err(StoreError::InvalidArgument(format!(
                "unsupported export format {other:?} (expected json or csv)"
            ))),
        }
    }
}

fn flows_to_csv(flows: &[FlowRecord]) -> String {
    let mut out = String::from(
        "id,device_id,source_ip,source_port,dest_ip,dest_port,protocol,\
         bytes_in,bytes_out,packets_in,packets_out,first_seen,last_seen,\
         duration_ms,status,domain,sni,application,country,connection_state,\
         rtt_ms,jitter_ms,retransmissions,threat_level\n",
    );
    for f in flows {
        let line = [
            csv_field(&f.id),
            csv_field(f.device_id.as_deref().unwrap_or("")),
            csv_field(&f.src_ip.to_string()),
            f.src_port.to_string(),
            csv_field(&f.dst_ip.to_string()),
            f.dst_port.to_string(),
            csv_field(&f.protocol),
            f.bytes_in.to_string(),
            f.bytes_out.to_string(),
            f.packets_in.to_string(),
            f.packets_out.to_string(),
            f.first_seen.to_rfc3339(),
            f.last_seen.to_rfc3339(),
            f.duration_ms.to_string(),
            f.status.as_str().to_string(),
            csv_field(f.domain.as_deref().unwrap_or("")),
            csv_field(f.sni.as_deref().unwrap_or("")),
            csv_field(f.application.as_deref().unwrap_or("")),
            csv_field(f.country.as_deref().unwrap_or("")),
            f.connection_state.as_str().to_string(),
            f.rtt_ms.map(|v| format!("{v:.2}")).unwrap_or_default(),
            f.jitter_ms.map(|v| format!("{v:.2}")).unwrap_or_default(),
            f.retransmissions.to_string(),
            csv_field(f.threat_level.as_deref().unwrap_or("")),
        ]
        .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

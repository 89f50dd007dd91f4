use anyhow::Result;
use clap::Parser;
use netinsight::{config, pipeline};
use tracing::info;

/// NetInsight — passive network traffic sensor.
#[derive(Parser, Debug)]
#[command(name = "netinsight", version, about)]
struct Cli {
    /// Interface to monitor (overrides the config file).
    #[arg(short, long)]
    interface: Option<String>,

    /// Path to the SQLite database file.
    #[arg(short, long, default_value = "netinsight.db")]
    db: String,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,
}

const BANNER: &str = r#"
  _   _      _   ___           _       _     _
 | \ | | ___| |_|_ _|_ __  ___(_) __ _| |__ | |_
 |  \| |/ _ \ __|| || '_ \/ __| |/ _` | '_ \| __|
 | |\  |  __/ |_ | || | | \__ \ | (_| | | | | |_
 |_| \_|\___|\__|___|_| |_|___/_|\__, |_| |_|\__|
                                 |___/
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load optional config file before logging so log settings apply.
    let mut app_config = if let Some(ref path) = cli.config {
        config::AppConfig::from_file(path)?
    } else {
        config::AppConfig::default()
    };
    if let Some(interface) = cli.interface {
        app_config.capture.interface = interface;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| app_config.log.level.clone().into());
    if app_config.log.structured {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    println!("{BANNER}");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        interface = %app_config.capture.interface,
        db = %cli.db,
        "Starting NetInsight sensor"
    );

    let pipeline = pipeline::Pipeline::start(app_config, &cli.db).await?;

    // Periodic health line so an operator tailing the log sees liveness.
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let health = pipeline.health();
                info!(
                    capturing = health.capture.running,
                    pps = format!("{:.1}", health.capture.pps),
                    packets = health.capture.packets_captured,
                    flows = health.capture.flows_detected,
                    dropped = health.capture.dropped,
                    subscribers = health.subscribers,
                    "Health"
                );
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    pipeline.stop().await;

    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kafka_toolkit::{
    AdminError, BrokerState, Cadence, ConfigInspector, Delivery, Toolkit, ToolkitSettings,
    TopicSpec,
};
use kafka_toolkit_client::global_metrics;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kafka-toolkit")]
#[command(about = "Supervise a local Kafka broker and simulate client traffic")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show mode, endpoints, key settings and problems of an installation
    Inspect {
        /// Kafka installation directory
        installation: PathBuf,

        /// Only show properties whose key or value contains this text
        #[arg(long)]
        search: Option<String>,
    },

    /// Start the broker and stream its events until Ctrl+C
    Run {
        /// Kafka installation directory
        installation: PathBuf,

        /// Create this topic and run a producer/consumer pair against it
        #[arg(long)]
        simulate: Option<String>,

        /// Producer cadence in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Consumer group for the simulated consumer
        #[arg(long, default_value = "kafka-toolkit-sim")]
        group: String,

        /// Partitions for the simulated topic
        #[arg(long, default_value = "3")]
        partitions: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = parse_log_level(&args.log_level);
    tracing_subscriber::fmt()
        .with_max_level(level.unwrap_or(tracing::Level::INFO))
        .init();
    if level.is_none() {
        warn!("Invalid log level '{}', defaulting to 'info'", args.log_level);
    }

    match args.command {
        Command::Inspect {
            installation,
            search,
        } => inspect(installation, search),
        Command::Run {
            installation,
            simulate,
            interval_ms,
            group,
            partitions,
        } => {
            let settings = ToolkitSettings::from_env().context("loading settings")?;
            run(installation, settings, simulate, interval_ms, group, partitions).await
        }
    }
}

fn inspect(installation: PathBuf, search: Option<String>) -> anyhow::Result<()> {
    let config = ConfigInspector::new()
        .parse(&installation)
        .with_context(|| format!("inspecting {}", installation.display()))?;

    if let Some(term) = search {
        for (key, value) in config.search(&term) {
            println!("{}={}", key, value);
        }
        return Ok(());
    }

    println!("Installation: {}", config.installation_path.display());
    println!("Properties:   {}", config.properties_path.display());
    println!("Mode:         {}", config.mode);
    println!("Bootstrap:    {}", config.bootstrap_servers());

    let settings = config.key_settings();
    println!("\nKey settings:");
    for (key, value) in settings.common.iter().chain(settings.mode_specific.iter()) {
        println!("  {} = {}", key, value);
    }

    let issues = config.validate();
    if issues.is_empty() {
        println!("\nNo problems found");
    } else {
        println!("\nProblems:");
        for issue in issues {
            println!("  - {}", issue);
        }
    }
    Ok(())
}

async fn run(
    installation: PathBuf,
    settings: ToolkitSettings,
    simulate: Option<String>,
    interval_ms: u64,
    group: String,
    partitions: i32,
) -> anyhow::Result<()> {
    let toolkit = Toolkit::open(&installation, settings)
        .with_context(|| format!("opening {}", installation.display()))?;

    let mut events = toolkit.bus().subscribe();
    let printer = tokio::spawn(async move {
        while let Some(delivery) = events.recv().await {
            match delivery {
                Delivery::Event(envelope) => println!("{}", envelope.event),
                Delivery::Gap { missed } => println!("... {} events dropped ...", missed),
            }
        }
    });

    let info = toolkit.start_broker().await.context("starting broker")?;
    info!("Broker running (pid {:?})", info.pid);

    if let Some(topic) = simulate {
        if let Err(e) = start_simulation(&toolkit, &topic, interval_ms, &group, partitions).await {
            error!("Simulation not started: {:#}", e);
        }
    }

    let mut state = toolkit.supervisor().state_watch();
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        failed = state.wait_for(|s| matches!(s, BrokerState::Failed(_))) => {
            warn!("Broker is now {}", failed);
        }
    }

    toolkit.shutdown().await.context("stopping broker")?;

    let metrics = global_metrics().snapshot();
    info!(
        "Client totals: {} sent ({} failed, avg {:.0}us), {} consumed ({} failed), {} admin requests ({} failed)",
        metrics.records_sent,
        metrics.send_errors,
        metrics.average_send_latency_us,
        metrics.records_consumed,
        metrics.consume_errors,
        metrics.admin_requests,
        metrics.admin_errors
    );

    // Let the printer flush the final lifecycle events.
    tokio::time::sleep(Duration::from_millis(200)).await;
    printer.abort();

    info!("Kafka toolkit shut down successfully");
    Ok(())
}

async fn start_simulation(
    toolkit: &Toolkit,
    topic: &str,
    interval_ms: u64,
    group: &str,
    partitions: i32,
) -> anyhow::Result<()> {
    match toolkit
        .admin()
        .create_topic(&TopicSpec::new(topic, partitions, 1))
        .await
    {
        Ok(()) | Err(AdminError::AlreadyExists { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let simulation = toolkit.simulation();
    let consumer = simulation.start_consumer(topic, group)?;
    let producer =
        simulation.start_producer(topic, Cadence::Every(Duration::from_millis(interval_ms)))?;
    info!("Simulating on '{}': {} produces, {} consumes", topic, producer, consumer);
    Ok(())
}

fn parse_log_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

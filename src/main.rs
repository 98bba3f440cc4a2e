//! ami-statsd entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use ami_statsd::constants::{
    DEFAULT_KEEPALIVE_MS, DEFAULT_LOGIN_EVENTS, DEFAULT_RECONNECT_DELAY_MS, ERROR_QUEUE_SIZE,
};
use ami_statsd::{
    AmiClient, AmiTarget, CallRegistry, CallTracker, ClientOptions, MetricsEmitter, StatsdSink,
    StatsdTarget, Supervisor, TlsMode,
};

/// Follow Asterisk calls over AMI and publish call metrics to statsd.
#[derive(Debug, Parser)]
#[command(name = "ami-statsd", version, about)]
struct Cli {
    /// AMI server as `user:password@host[:port]`
    #[arg(long, env = "AMI_STATSD_ASTERISK")]
    asterisk: AmiTarget,

    /// statsd server as `host[:port][/prefix]`; metrics are disabled when absent
    #[arg(long, env = "AMI_STATSD_STATSD")]
    statsd: Option<StatsdTarget>,

    /// Connect to AMI over TLS
    #[arg(long)]
    tls: bool,

    /// Accept any TLS server certificate
    #[arg(long, requires = "tls")]
    insecure: bool,

    /// Event classes requested at login
    #[arg(long, default_value = DEFAULT_LOGIN_EVENTS)]
    events: String,

    /// Interval between keepalive pings
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_MS, value_parser = clap::value_parser!(u64).range(1..))]
    keepalive_ms: u64,

    /// Pause before reconnecting after the connection is lost
    #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    reconnect_delay_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = match &cli.statsd {
        Some(target) => {
            let sink = StatsdSink::connect(target).await?;
            info!("Publishing metrics to {}", target.address());
            MetricsEmitter::new(Arc::new(sink))
        }
        None => {
            warn!("No statsd target given, metrics disabled");
            MetricsEmitter::disabled()
        }
    };
    let tracker = CallTracker::new(Arc::new(CallRegistry::new()), Arc::new(metrics));

    let options = ClientOptions {
        tls: if cli.tls {
            TlsMode::Enabled {
                verify: !cli.insecure,
            }
        } else {
            TlsMode::Disabled
        },
        ..Default::default()
    };
    let client = AmiClient::new(cli.asterisk, options);
    tracker.install(&client)?;

    let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE_SIZE);
    client.set_error_channel(error_tx);
    tokio::spawn(async move {
        while let Some(e) = error_rx
            .recv()
            .await
        {
            warn!("{}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(client.clone(), tracker, shutdown_tx)?;

    Supervisor::new(client)
        .login_params([("Events", cli.events)])
        .keepalive(Duration::from_millis(cli.keepalive_ms))
        .reconnect_delay(Duration::from_millis(cli.reconnect_delay_ms))
        .run(shutdown_rx)
        .await;
    Ok(())
}

/// Print pending actions, tracked calls and gauge identifiers as JSON.
fn dump_state(client: &AmiClient, tracker: &CallTracker) {
    let state = serde_json::json!({
        "status": format!("{:?}", client.status()),
        "pending_actions": client.pending_action_ids(),
        "dropped_events": client.dropped_event_count(),
        "calls": tracker
            .registry()
            .snapshot(),
        "gauges": tracker
            .metrics()
            .registered_gauges(),
    });
    match serde_json::to_string_pretty(&state) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize state: {}", e),
    }
}

#[cfg(unix)]
fn spawn_signal_listener(
    client: AmiClient,
    tracker: CallTracker,
    shutdown_tx: watch::Sender<bool>,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = sigusr1.recv() => dump_state(&client, &tracker),
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, resetting gauges");
                    tracker
                        .metrics()
                        .reset_all();
                }
            }
        }
        let _ = shutdown_tx.send(true);
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(
    client: AmiClient,
    tracker: CallTracker,
    shutdown_tx: watch::Sender<bool>,
) -> std::io::Result<()> {
    let _ = (client, tracker);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received Ctrl+C, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });
    Ok(())
}

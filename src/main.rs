#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dronebridge_rs::config::{is_valid_uuid, Config};
use dronebridge_rs::control::ControlChannel;
use dronebridge_rs::endpoint::MavlinkEndpoint;
use dronebridge_rs::forwarder::{self, Forwarder};
use dronebridge_rs::liveness::{LinkState, LivenessMonitor};
use dronebridge_rs::metrics::Metrics;
use dronebridge_rs::secret_store::SecretStore;
use dronebridge_rs::session::{SessionManager, SessionState};

/// Extra wait for a heartbeat when discovery times out permissively.
const DISCOVERY_FALLBACK_WAIT: Duration = Duration::from_secs(10);

/// Grace before upstream forwarding starts without a session heartbeat.
const HEARTBEAT_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "dronebridge", version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: String,

    /// Log level: debug, info, warn, error (overrides config)
    #[arg(long)]
    log: Option<String>,

    /// Register this drone with the fleet router
    #[arg(long)]
    register: bool,

    /// Override local UDP listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override web server port (collaborator surface)
    #[arg(long)]
    web_port: Option<u16>,

    /// Override drone UUID
    #[arg(long)]
    uuid: Option<String>,

    /// Override router host
    #[arg(long)]
    server: Option<String>,

    /// Override router port
    #[arg(long)]
    server_port: Option<u16>,

    /// Override UDP broadcast bind port (-1 disabled, 0 random, >0 bind)
    #[arg(long)]
    broadcast_port: Option<i32>,

    /// Use an isolated per-UUID secret file under test_mode/
    #[arg(long)]
    test_mode: bool,
}

fn apply_overrides(cfg: &mut Config, args: &Args) {
    if let Some(port) = args.listen_port {
        info!(
            "[override] local listen port: {} -> {}",
            cfg.network.local_listen_port, port
        );
        cfg.network.local_listen_port = port;
    }
    if let Some(port) = args.web_port {
        info!("[override] web port: {} -> {}", cfg.web.port, port);
        cfg.web.port = port;
    }
    if let Some(uuid) = &args.uuid {
        info!("[override] drone UUID: {} -> {}", cfg.auth.uuid, uuid);
        cfg.auth.uuid = uuid.clone();
    }
    if let Some(server) = &args.server {
        info!("[override] router host: {} -> {}", cfg.auth.host, server);
        cfg.auth.host = server.clone();
    }
    if let Some(port) = args.server_port {
        info!("[override] router port: {} -> {}", cfg.auth.port, port);
        cfg.auth.port = port;
    }
    if let Some(port) = args.broadcast_port {
        info!(
            "[override] broadcast port: {} -> {}",
            cfg.network.broadcast_port, port
        );
        cfg.network.broadcast_port = port;
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(&args.config)
        .await
        .with_context(|| format!("loading config from {}", args.config))?;

    let level = args
        .log
        .clone()
        .unwrap_or_else(|| cfg.log.level.clone());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting dronebridge with config {}", args.config);
    apply_overrides(&mut cfg, &args);
    cfg.validate().context("validating configuration")?;

    if cfg.auth.enabled && !is_valid_uuid(&cfg.auth.uuid) {
        anyhow::bail!(
            "invalid drone UUID '{}': strictly 8-4-4-4-12 hex required",
            cfg.auth.uuid
        );
    }

    let store = if args.test_mode {
        let store = SecretStore::test_mode("test_mode", &cfg.auth.uuid)?;
        info!(
            "test mode: using isolated secret file {}",
            store.path().display()
        );
        store
    } else {
        SecretStore::new()
    };

    let metrics = Metrics::new();
    let session = SessionState::new_shared();
    let link = LinkState::new();

    // The broadcast fallback needs a bind address for the local interface.
    let broadcast = if cfg.network.broadcast_port >= 0 {
        if cfg.ethernet.local_ip.is_empty() {
            warn!("broadcast discovery requested but ethernet.local_ip is not set, disabling");
            None
        } else {
            Some((
                cfg.ethernet.local_ip.clone(),
                cfg.network.broadcast_port as u16,
            ))
        }
    } else {
        None
    };

    // Startup order: listener, discovery, sender, forwarder, auth, refresh
    // loop, liveness, session heartbeat.
    let endpoint = MavlinkEndpoint::bind(
        cfg.network.local_listen_port,
        broadcast,
        cfg.target_addr(),
        session.clone(),
    )
    .await?;

    let discovered = forwarder::discover(
        &endpoint,
        Duration::from_secs(cfg.ethernet.pixhawk_connection_timeout),
        cfg.ethernet.allow_missing_pixhawk,
        DISCOVERY_FALLBACK_WAIT,
    )
    .await?;
    endpoint.set_out_system_id(discovered.system_id);
    if let Some(addr) = discovered.fc_addr {
        endpoint.note_fc_addr(addr);
    }

    endpoint.rebuild_sender().await?;
    info!(
        "forwarding to {} with system id {}",
        cfg.target_addr(),
        discovered.system_id
    );

    let control = ControlChannel::new(
        &cfg.auth,
        store,
        session.clone(),
        link.clone(),
        metrics.clone(),
    );

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let fwd = Forwarder::new(
        endpoint.clone(),
        link.clone(),
        metrics.clone(),
        cfg.log.verbose,
        Duration::from_secs(cfg.log.stats_interval),
        discovered.connected,
        None,
        None,
    );

    handles.push(tokio::spawn(
        fwd.clone().run_downstream(cancel.child_token()),
    ));

    // Upstream forwarding starts once the router has seen our session
    // heartbeat on the data socket (bounded by a grace period).
    {
        let fwd = fwd.clone();
        let endpoint = endpoint.clone();
        let token = cancel.child_token();
        let gated = cfg.auth.enabled;
        handles.push(tokio::spawn(async move {
            if gated {
                endpoint.wait_first_heartbeat(HEARTBEAT_GRACE).await;
            }
            fwd.run_upstream(token).await;
        }));
    }

    if cfg.auth.enabled {
        if args.register {
            info!("registration requested");
            control.register().await.context("registration failed")?;
        }
        control
            .authenticate()
            .await
            .context("authentication failed")?;

        let manager = SessionManager::new(
            control.clone(),
            session.clone(),
            link.clone(),
            metrics.clone(),
            Duration::from_secs(cfg.auth.keepalive_interval),
        );
        handles.push(tokio::spawn(manager.run(cancel.child_token())));

        handles.push(tokio::spawn(endpoint.clone().run_session_heartbeat(
            cfg.auth.session_heartbeat_frequency,
            cancel.child_token(),
        )));
    } else {
        warn!("authentication disabled, running in insecure mode");
    }

    let monitor = LivenessMonitor::new(
        link.clone(),
        endpoint.clone(),
        control.clone(),
        metrics.clone(),
    );
    handles.push(tokio::spawn(monitor.run(cancel.child_token())));

    info!("dronebridge running, press Ctrl+C to stop");
    wait_for_shutdown().await;

    info!("initiating graceful shutdown");
    cancel.cancel();

    // Give each loop one tick to observe the cancellation.
    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(2), drain)
        .await
        .is_err()
    {
        warn!("some tasks did not stop in time");
    }

    control.force_reconnect().await;

    let snapshot = metrics.snapshot();
    let total_sent: u64 = snapshot.sent.values().sum();
    info!(
        "shutdown complete: {} frames forwarded, uptime {:?}",
        total_sent, snapshot.uptime
    );
    Ok(())
}

//! Tailnet coordination daemon
//!
//! Accepts multiplexed TCP connections from agents and clients and serves the
//! coordinator RPCs on them. Peers learn each other's nodes here and then
//! talk directly or through DERP relays.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tailnet_auth::{
    InsecureAuthenticator, JwtAuthenticator, JwtValidator, PeerAuthenticator, PeerClaims,
    ResumeTokenProvider,
};
use tailnet_coordinator::{CoordinatorConfig, DerpMapDistributor, TailnetService};
use tailnet_mux::{MuxConfig, MuxListener, MuxSession};
use tailnet_proto::{DerpMap, PeerKind};
use tailnet_transport::{TransportConnection, TransportListener};

const DEFAULT_LISTEN: &str = "0.0.0.0:7443";
const DEFAULT_DERP_RELOAD_SECS: u64 = 60;
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tailnet coordinator - relays node updates between agents and clients
#[derive(Parser, Debug)]
#[command(name = "tailnet-coordd")]
#[command(about = "Run a tailnet coordination server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a JWT a peer presents in its Coordinate handshake
    GenerateToken {
        /// JWT secret (must match the coordinator's --jwt-secret)
        #[arg(long, env = "TAILNET_JWT_SECRET")]
        secret: String,

        /// Peer ID (a random one is generated if omitted)
        #[arg(long)]
        peer_id: Option<Uuid>,

        /// Peer kind: "agent" or "client"
        #[arg(long, default_value = "client", value_parser = parse_peer_kind)]
        kind: PeerKind,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long, default_value = "tailnet-coordd")]
        issuer: String,

        #[arg(long, default_value = "tailnet-peer")]
        audience: String,

        /// Agents a client may open tunnels to (repeatable)
        /// If not specified, all agents are allowed
        #[arg(long = "agent")]
        allowed_agents: Vec<Uuid>,
    },

    /// Print a random hex secret for --resume-token-secret
    GenerateSecret,
}

#[derive(Parser, Debug, Default)]
struct ServerArgs {
    /// YAML config file; command-line flags override its values
    #[arg(long, env = "TAILNET_CONFIG")]
    config: Option<PathBuf>,

    /// Address for peer connections [default: 0.0.0.0:7443]
    #[arg(long, env = "TAILNET_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "TAILNET_LOG_LEVEL")]
    log_level: Option<String>,

    /// JWT secret for authenticating peer handshakes
    /// Without it every handshake is trusted (development only)
    #[arg(long, env = "TAILNET_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Required JWT issuer
    #[arg(long, env = "TAILNET_JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// Required JWT audience
    #[arg(long, env = "TAILNET_JWT_AUDIENCE")]
    jwt_audience: Option<String>,

    /// Hex-encoded secret for signing resume tokens
    /// If omitted, a random secret is used and tokens do not survive a restart
    #[arg(long, env = "TAILNET_RESUME_TOKEN_SECRET")]
    resume_token_secret: Option<String>,

    /// DERP map JSON file, re-read periodically
    #[arg(long, env = "TAILNET_DERP_MAP")]
    derp_map: Option<PathBuf>,

    /// Seconds between DERP map reloads [default: 60]
    #[arg(long)]
    derp_reload_interval: Option<u64>,

    /// Seconds a dropped peer may take to resume
    #[arg(long)]
    grace_period: Option<u64>,

    /// Per-peer outbound update queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds allowed for the first message on a new stream
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Seconds between mux keepalive pings
    #[arg(long)]
    keep_alive: Option<u64>,

    /// Seconds without traffic before a connection is dropped
    #[arg(long)]
    idle_timeout: Option<u64>,
}

/// Contents of the `--config` file
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    log_level: Option<String>,
    jwt_secret: Option<String>,
    jwt_issuer: Option<String>,
    jwt_audience: Option<String>,
    resume_token_secret: Option<String>,
    derp_map: Option<PathBuf>,
    derp_reload_interval: Option<u64>,
    keep_alive: Option<u64>,
    idle_timeout: Option<u64>,
    coordinator: CoordinatorConfig,
}

/// Effective daemon settings after merging the file and the command line
#[derive(Debug)]
struct Settings {
    listen: SocketAddr,
    log_level: String,
    jwt_secret: Option<String>,
    jwt_issuer: Option<String>,
    jwt_audience: Option<String>,
    resume_token_secret: Option<String>,
    derp_map: Option<PathBuf>,
    derp_reload_interval: Duration,
    mux: MuxConfig,
    coordinator: CoordinatorConfig,
}

impl Settings {
    fn merge(args: ServerArgs, file: FileConfig) -> Result<Self> {
        let listen = match args.listen.or(file.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN.parse()?,
        };

        let mut coordinator = file.coordinator;
        if let Some(secs) = args.grace_period {
            coordinator.resume_grace_period = Duration::from_secs(secs);
        }
        if let Some(capacity) = args.queue_capacity {
            coordinator.queue_capacity = capacity;
        }
        if let Some(secs) = args.handshake_timeout {
            coordinator.handshake_timeout = Duration::from_secs(secs);
        }
        coordinator
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid coordinator config: {}", e))?;

        let mut mux = MuxConfig::default();
        if let Some(secs) = args.keep_alive.or(file.keep_alive) {
            mux = mux.with_keep_alive(Duration::from_secs(secs));
        }
        if let Some(secs) = args.idle_timeout.or(file.idle_timeout) {
            mux = mux.with_idle_timeout(Duration::from_secs(secs));
        }
        mux.validate().context("Invalid connection settings")?;

        Ok(Self {
            listen,
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            jwt_secret: args.jwt_secret.or(file.jwt_secret),
            jwt_issuer: args.jwt_issuer.or(file.jwt_issuer),
            jwt_audience: args.jwt_audience.or(file.jwt_audience),
            resume_token_secret: args.resume_token_secret.or(file.resume_token_secret),
            derp_map: args.derp_map.or(file.derp_map),
            derp_reload_interval: Duration::from_secs(
                args.derp_reload_interval
                    .or(file.derp_reload_interval)
                    .unwrap_or(DEFAULT_DERP_RELOAD_SECS),
            ),
            mux,
            coordinator,
        })
    }
}

fn parse_peer_kind(s: &str) -> Result<PeerKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "agent" => Ok(PeerKind::Agent),
        "client" => Ok(PeerKind::Client),
        other => Err(format!("unknown peer kind '{}' (expected agent or client)", other)),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn load_derp_map(path: &Path) -> Result<DerpMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read DERP map {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse DERP map {}", path.display()))
}

fn generate_token(
    secret: &str,
    peer_id: Uuid,
    kind: PeerKind,
    hours: i64,
    issuer: String,
    audience: String,
    allowed_agents: Vec<Uuid>,
) -> Result<()> {
    let mut claims = PeerClaims::new(
        peer_id,
        kind,
        issuer,
        audience,
        chrono::Duration::hours(hours),
    );
    if !allowed_agents.is_empty() {
        claims = claims.with_allowed_agents(allowed_agents.iter().map(Uuid::to_string).collect());
    }

    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("\nPeer token generated\n");
    println!("Peer ID:       {}", peer_id);
    println!("Kind:          {}", kind);
    println!("Valid for:     {} hours", hours);
    println!("Expires:       {}", claims.exp_formatted());
    if kind == PeerKind::Client {
        if allowed_agents.is_empty() {
            println!("Agents:        ALL");
        } else {
            let agents: Vec<String> = allowed_agents.iter().map(Uuid::to_string).collect();
            println!("Agents:        {}", agents.join(", "));
        }
    }

    println!("\n{}", "=".repeat(70));
    println!("TOKEN:");
    println!("{}", "=".repeat(70));
    println!("{}", token);
    println!("{}\n", "=".repeat(70));

    Ok(())
}

fn build_authenticator(settings: &Settings) -> Arc<dyn PeerAuthenticator> {
    match &settings.jwt_secret {
        Some(secret) => {
            let mut validator = JwtValidator::new(secret.as_bytes());
            if let Some(issuer) = &settings.jwt_issuer {
                validator = validator.with_issuer(issuer.clone());
            }
            if let Some(audience) = &settings.jwt_audience {
                validator = validator.with_audience(audience.clone());
            }
            info!("JWT authentication enabled");
            Arc::new(JwtAuthenticator::new(validator))
        }
        None => {
            warn!("Running without JWT authentication, every handshake is trusted");
            Arc::new(InsecureAuthenticator)
        }
    }
}

fn build_resume_tokens(settings: &Settings) -> Result<ResumeTokenProvider> {
    let lifetime = settings.coordinator.resume_token_lifetime;
    match &settings.resume_token_secret {
        Some(encoded) => {
            let secret = hex::decode(encoded.trim())
                .context("Resume token secret must be hex-encoded")?;
            if secret.len() < 16 {
                anyhow::bail!("Resume token secret must be at least 16 bytes");
            }
            Ok(ResumeTokenProvider::new(&secret, lifetime))
        }
        None => {
            warn!("No resume token secret configured; peers cannot resume across restarts");
            Ok(ResumeTokenProvider::with_random_secret(lifetime))
        }
    }
}

/// Re-read the DERP map file and publish it when its topology changed
fn spawn_derp_reload(
    derp: Arc<DerpMapDistributor>,
    path: PathBuf,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the map was loaded at startup
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => match load_derp_map(&path) {
                    Ok(map) => {
                        if let Some(version) = derp.update_if_changed(map) {
                            info!("Reloaded DERP map from {} (version {})", path.display(), version);
                        }
                    }
                    Err(e) => warn!("Keeping current DERP map: {:#}", e),
                },
            }
        }
        debug!("DERP map reload stopped");
    })
}

fn spawn_status_reporter(service: Arc<TailnetService>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let health = service.registry().health_snapshot();
                    info!(
                        agents = health.agents.len(),
                        agents_connected = health.connected_agents(),
                        clients = health.clients,
                        parked = health.parked,
                        derp_version = service.derp().version(),
                        "Coordinator status"
                    );
                }
            }
        }
    })
}

/// Accept connections until shutdown, then close every session
async fn accept_loop(
    listener: MuxListener,
    service: Arc<TailnetService>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((session, peer_addr)) => {
                    debug!("New peer connection from {}", peer_addr);
                    connections.spawn(serve_session(
                        Arc::new(session),
                        service.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!("Connection task failed: {}", e);
                }
            }
        }
    }

    info!("Closing {} peer connection(s)", connections.len());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Connections did not close in time, aborting them");
        connections.abort_all();
    }
}

async fn serve_session(
    session: Arc<MuxSession>,
    service: Arc<TailnetService>,
    shutdown: CancellationToken,
) {
    let serve = service.serve_connection(session.clone());
    tokio::pin!(serve);

    tokio::select! {
        _ = &mut serve => {}
        _ = shutdown.cancelled() => {
            session.close(0, "coordinator shutting down").await;
            serve.await;
        }
    }
}

async fn run(args: ServerArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(args, file)?;

    init_logging(&settings.log_level)?;

    info!("Starting tailnet coordinator");
    info!("Peer connections: {}", settings.listen);
    info!(
        "Resume grace period: {}s",
        settings.coordinator.resume_grace_period.as_secs()
    );

    let derp = match &settings.derp_map {
        Some(path) => {
            let map = load_derp_map(path)?;
            info!(
                "Loaded DERP map from {} ({} regions)",
                path.display(),
                map.regions.len()
            );
            Arc::new(DerpMapDistributor::new(map))
        }
        None => {
            info!("No DERP map configured, peers receive an empty map");
            Arc::new(DerpMapDistributor::default())
        }
    };

    let service = Arc::new(
        TailnetService::new(settings.coordinator.clone())
            .with_authenticator(build_authenticator(&settings))
            .with_resume_tokens(build_resume_tokens(&settings)?)
            .with_derp_distributor(derp.clone()),
    );

    let shutdown = CancellationToken::new();
    let mut tasks = vec![
        service.spawn_janitor(shutdown.clone()),
        spawn_status_reporter(service.clone(), shutdown.clone()),
    ];
    if let Some(path) = settings.derp_map.clone() {
        tasks.push(spawn_derp_reload(
            derp,
            path,
            settings.derp_reload_interval,
            shutdown.clone(),
        ));
    }

    let listener = MuxListener::bind(settings.listen, settings.mux.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", settings.listen))?;
    let accept = tokio::spawn(accept_loop(listener, service.clone(), shutdown.clone()));

    info!("Tailnet coordinator is running, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    shutdown.cancel();
    if let Err(e) = accept.await {
        warn!("Accept loop failed: {}", e);
    }
    for task in tasks {
        let _ = task.await;
    }

    info!(
        "Tailnet coordinator stopped ({} peers still registered)",
        service.registry().peer_count()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken {
                secret,
                peer_id,
                kind,
                hours,
                issuer,
                audience,
                allowed_agents,
            } => generate_token(
                &secret,
                peer_id.unwrap_or_else(Uuid::new_v4),
                kind,
                hours,
                issuer,
                audience,
                allowed_agents,
            ),
            Commands::GenerateSecret => {
                println!("{}", hex::encode(ResumeTokenProvider::generate_secret()));
                Ok(())
            }
        };
    }

    run(cli.server_args).await
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

use clap::Parser;
use env_logger::{Builder, Env};
use sandterm::{server::AllowedOrigins, session::Limits, supervisor, Config, DockerRuntime};
use std::{sync::Arc, time::Duration};

/// Disposable sandbox containers, served as browser terminals
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// TCP port for the HTTP and WebSocket server
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// Container image each sandbox is created from
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "webenv-sandbox")]
    image: String,

    /// Number of fresh containers to keep ready
    #[arg(long, env = "TARGET_FRESH_POOL_SIZE", default_value_t = 3)]
    pool_size: usize,

    /// Milliseconds without a heartbeat before a session is reclaimed
    #[arg(long, env = "SESSION_IDLE_TIMEOUT_MS", default_value_t = 300_000)]
    idle_timeout_ms: u64,

    /// Maximum concurrent sessions
    #[arg(long, env = "MAX_CONCURRENT_SESSIONS", default_value_t = 20)]
    max_sessions: usize,

    /// Maximum concurrent sessions from one client address
    #[arg(long, env = "MAX_SESSIONS_PER_IP", default_value_t = 2)]
    max_sessions_per_ip: usize,

    /// Comma separated browser origins allowed to call the API, or *
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "*")]
    allowed_origins: String,

    /// Seconds between idle session sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Log filter, like `info` or `sandterm=debug`
    #[arg(short, long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            port: self.port,
            pool_size: self.pool_size,
            limits: Limits {
                max_sessions: self.max_sessions,
                max_sessions_per_origin: self.max_sessions_per_ip,
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            },
            allowed_origins: AllowedOrigins::parse(&self.allowed_origins),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    Builder::from_env(Env::default().default_filter_or(&args.log_level)).init();

    let config = args.config();
    log::debug!("{:?}", config);
    let runtime = Arc::new(DockerRuntime::new(args.image.as_str()));

    if let Err(err) = supervisor::run(config, runtime, shutdown_signal()).await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("can't listen for ctrl-c, {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("can't listen for SIGTERM, {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => log::info!("received interrupt"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}

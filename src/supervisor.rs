//! Wires the pool, registry, bridge and HTTP front end together
//!
//! The [Supervisor] owns the background tasks and knows the order in which
//! everything must be torn down so that no container is left running.

use crate::{
    bridge::Bridge,
    errors::ServerError,
    pool::ContainerPool,
    runtime::Runtime,
    server::{self, AllowedOrigins},
    session::{Limits, SessionRegistry},
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// Everything needed to run a server
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on, on all interfaces
    pub port: u16,
    /// Number of fresh containers kept ready
    pub pool_size: usize,
    pub limits: Limits,
    pub allowed_origins: AllowedOrigins,
    /// How often idle sessions are looked for
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 4000,
            pool_size: 3,
            limits: Limits::default(),
            allowed_origins: AllowedOrigins::any(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The running service, minus its listener
pub struct Supervisor {
    runtime: Arc<dyn Runtime>,
    pool: Arc<ContainerPool>,
    registry: Arc<SessionRegistry>,
    bridge: Arc<Bridge>,
    allowed_origins: AllowedOrigins,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: &Config, runtime: Arc<dyn Runtime>) -> Self {
        let pool = Arc::new(ContainerPool::new(runtime.clone(), config.pool_size));
        let registry = Arc::new(SessionRegistry::new(
            pool.clone(),
            runtime.clone(),
            config.limits.clone(),
        ));
        let bridge = Arc::new(Bridge::new(registry.clone(), runtime.clone()));
        Supervisor {
            runtime,
            pool,
            registry,
            bridge,
            allowed_origins: config.allowed_origins.clone(),
            sweep_interval: config.sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> axum::Router {
        server::router(
            self.registry.clone(),
            self.bridge.clone(),
            self.allowed_origins.clone(),
        )
    }

    /// Begin warming the pool and sweeping idle sessions
    ///
    /// The initial warm runs in the background. Requests that arrive before
    /// it finishes get containers created on demand.
    pub fn start(&self) {
        self.pool.spawn_warm();
        let sweeper = self.registry.spawn_sweeper(self.sweep_interval);
        if let Some(old) = self.sweeper.lock().replace(sweeper) {
            old.abort();
        }
    }

    /// Stop background work and destroy every container
    ///
    /// The registry and pool are closed first, so requests still in flight
    /// can't add sessions or containers behind the sweep. Sessions are then
    /// terminated all at once, and any refill still running is allowed to
    /// finish so the containers it creates are included in the final sweep of
    /// the pool.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.registry.close().await;
        self.pool.close();

        let sessions = self.registry.export_all();
        log::info!("shutdown terminating {} sessions", sessions.len());
        join_all(
            sessions
                .iter()
                .map(|session| self.registry.terminate(session.session_id.as_str())),
        )
        .await;

        self.pool.quiesce().await;

        let remaining = self.pool.list_all_ids();
        log::info!("shutdown destroying {} containers", remaining.len());
        join_all(remaining.iter().map(|id| async move {
            if let Err(err) = self.runtime.destroy(id).await {
                log::error!("failed to destroy container {} at shutdown, {}", id, err);
            }
            self.pool.forget(id);
        }))
        .await;
        log::info!("shutdown complete");
    }
}

/// Serve until `signal` resolves, then shut everything down
pub async fn run<F>(
    config: Config,
    runtime: Arc<dyn Runtime>,
    signal: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    log::info!("listening on {}", listener.local_addr()?);

    let supervisor = Supervisor::new(&config, runtime);
    supervisor.start();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = supervisor
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    signal.await;
    log::info!("shutting down");
    let _ = stop_tx.send(());

    // Graceful shutdown doesn't track upgraded connections. Destroying the
    // containers ends their shells, and each bridge then closes its socket.
    supervisor.shutdown().await;
    server.await??;
    Ok(())
}

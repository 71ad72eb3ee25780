//! Disposable sandbox containers, served as terminals over WebSocket
//!
//! A [ContainerPool] keeps hardened containers warm, the [SessionRegistry]
//! binds each session to one of them under capacity limits, and the
//! [Bridge] relays a pseudo-terminal inside the container to the client.
//! [supervisor::run()] puts it all behind an HTTP server.

pub mod bridge;
pub mod errors;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod session;
pub mod supervisor;

pub use crate::{
    bridge::Bridge,
    pool::ContainerPool,
    runtime::{ContainerId, DockerRuntime, Runtime, Shell},
    session::{Limits, Session, SessionRegistry},
    supervisor::{Config, Supervisor},
};

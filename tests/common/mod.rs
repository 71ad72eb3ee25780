#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sandterm::{
    errors::RuntimeError,
    runtime::{ContainerId, Runtime, Shell, ShellPeer},
};
use sandterm_protocol::TerminalSize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory runtime that records what it was asked to do
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    fail_exec: AtomicBool,
    fail_destroy: AtomicBool,
    destroy_gate: Arc<RwLock<()>>,
    execs: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
    created: Mutex<Vec<ContainerId>>,
    destroyed: Mutex<Vec<ContainerId>>,
    shells: Mutex<Vec<(ContainerId, TerminalSize, ShellPeer)>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRuntime::default())
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Block every destroy until the returned guard is dropped
    pub fn hold_destroys(&self) -> OwnedRwLockWriteGuard<()> {
        self.destroy_gate.clone().try_write_owned().unwrap()
    }

    /// Make every create take this long, so concurrent callers overlap
    pub fn create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    pub fn created(&self) -> Vec<ContainerId> {
        self.created.lock().clone()
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Every container a destroy was attempted on, failed or not
    pub fn destroyed(&self) -> Vec<ContainerId> {
        self.destroyed.lock().clone()
    }

    pub fn destroy_count(&self, id: &ContainerId) -> usize {
        self.destroyed.lock().iter().filter(|d| *d == id).count()
    }

    /// Number of shells started, including ones already taken
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Take the process side of the most recently started shell
    pub fn take_shell(&self) -> Option<(ContainerId, TerminalSize, ShellPeer)> {
        self.shells.lock().pop()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self) -> Result<ContainerId, RuntimeError> {
        let delay = *self.create_delay.lock();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::MissingContainerId);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = ContainerId::new(format!("fake-{}", n));
        self.created.lock().push(id.clone());
        Ok(id)
    }

    async fn destroy(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        tokio::task::yield_now().await;
        let _gate = self.destroy_gate.read().await;
        self.destroyed.lock().push(id.clone());
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(RuntimeError::IOError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "daemon unavailable",
            )));
        }
        // shells still running in the container go with it
        self.shells.lock().retain(|(shell_id, _, _)| shell_id != id);
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, size: TerminalSize) -> Result<Shell, RuntimeError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RuntimeError::Pty("no terminal for you".to_string()));
        }
        self.execs.fetch_add(1, Ordering::SeqCst);
        let (shell, peer) = Shell::pair();
        self.shells.lock().push((id.clone(), size, peer));
        Ok(shell)
    }
}

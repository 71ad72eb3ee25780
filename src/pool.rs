//! A warm pool of sandbox containers
//!
//! Creating a container takes seconds, so the pool keeps a target number of
//! unused "fresh" containers around and hands one out whenever a session is
//! created, refilling itself in the background.

use crate::{
    errors::RuntimeError,
    runtime::{ContainerId, Runtime},
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{task::JoinSet, time::Instant};

/// Lifecycle stage of a pooled container
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContainerStatus {
    /// Never used, waiting in the fresh set
    Fresh,
    /// Bound to a session
    Assigned,
    /// Being destroyed; never handed out again
    Terminating,
}

/// Bookkeeping for one container
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub status: ContainerStatus,
    pub created_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    containers: HashMap<ContainerId, ContainerRecord>,
    fresh: HashSet<ContainerId>,
    closed: bool,
}

impl PoolState {
    fn insert(&mut self, id: ContainerId, status: ContainerStatus) {
        if status == ContainerStatus::Fresh {
            self.fresh.insert(id.clone());
        }
        self.containers.insert(
            id.clone(),
            ContainerRecord {
                id,
                status,
                created_at: Instant::now(),
            },
        );
    }

    fn take_fresh(&mut self) -> Option<ContainerId> {
        let id = self.fresh.iter().next().cloned()?;
        self.fresh.remove(&id);
        if let Some(record) = self.containers.get_mut(&id) {
            record.status = ContainerStatus::Assigned;
        }
        Some(id)
    }
}

/// Owner of every container this process has created
pub struct ContainerPool {
    runtime: Arc<dyn Runtime>,
    target: usize,
    state: Mutex<PoolState>,
    // Held for the whole of one warm() pass, so two passes can't both see the
    // pool under target and overshoot it.
    warming: tokio::sync::Mutex<()>,
    refills: Mutex<JoinSet<()>>,
}

impl ContainerPool {
    pub fn new(runtime: Arc<dyn Runtime>, target: usize) -> Self {
        ContainerPool {
            runtime,
            target,
            state: Mutex::new(PoolState::default()),
            warming: tokio::sync::Mutex::new(()),
            refills: Mutex::new(JoinSet::new()),
        }
    }

    /// Target size of the fresh set
    pub fn target(&self) -> usize {
        self.target
    }

    /// Create containers until the fresh set reaches its target size
    ///
    /// A failed creation ends the pass early, leaving the pool under target
    /// until the next call. A closed pool creates nothing. Returns the number
    /// of containers created.
    pub async fn warm(&self) -> usize {
        let _guard = self.warming.lock().await;
        let mut created = 0;
        while self.needs_fresh() {
            match self.runtime.create().await {
                Ok(id) => {
                    log::info!("pool created fresh container {}", id);
                    self.state.lock().insert(id, ContainerStatus::Fresh);
                    created += 1;
                }
                Err(err) => {
                    log::error!("pool failed to create container, {}", err);
                    break;
                }
            }
        }
        created
    }

    /// Hand out a container for a new session
    ///
    /// Takes any fresh container if one is ready, otherwise creates one on
    /// the spot. Either way a background refill is started.
    pub async fn allocate(self: &Arc<Self>) -> Result<ContainerId, RuntimeError> {
        let taken = self.state.lock().take_fresh();
        let id = match taken {
            Some(id) => id,
            None => {
                log::info!("fresh pool empty, creating a container on demand");
                let id = self.runtime.create().await.map_err(|err| {
                    log::error!("on-demand container creation failed, {}", err);
                    err
                })?;
                self.state
                    .lock()
                    .insert(id.clone(), ContainerStatus::Assigned);
                id
            }
        };
        self.spawn_warm();
        log::info!("pool allocated container {}", id);
        Ok(id)
    }

    /// Run [ContainerPool::warm()] as a background task
    ///
    /// Failures are logged. [ContainerPool::quiesce()] waits for every task
    /// started this way.
    pub fn spawn_warm(self: &Arc<Self>) {
        if self.is_closed() {
            log::debug!("pool closed, not warming");
            return;
        }
        let pool = self.clone();
        let mut refills = self.refills.lock();
        while let Some(result) = refills.try_join_next() {
            log_refill_result(result);
        }
        refills.spawn(async move {
            let created = pool.warm().await;
            log::debug!("background warm created {} containers", created);
        });
    }

    /// Stop creating fresh containers
    ///
    /// Warms already running stop after their current creation. Containers
    /// they produce are still recorded, so [ContainerPool::list_all_ids()]
    /// covers them once [ContainerPool::quiesce()] returns.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn needs_fresh(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.fresh.len() < self.target
    }

    /// Wait until every background warm started so far has finished
    pub async fn quiesce(&self) {
        let mut refills = std::mem::take(&mut *self.refills.lock());
        while let Some(result) = refills.join_next().await {
            log_refill_result(result);
        }
    }

    /// Retire a container so it is never handed out again
    pub fn mark_terminating(&self, id: &ContainerId) {
        let mut state = self.state.lock();
        state.fresh.remove(id);
        if let Some(record) = state.containers.get_mut(id) {
            record.status = ContainerStatus::Terminating;
        }
    }

    /// Drop the record of a container whose destruction was attempted
    pub fn forget(&self, id: &ContainerId) {
        let mut state = self.state.lock();
        state.fresh.remove(id);
        state.containers.remove(id);
    }

    /// Every container created and not yet forgotten
    pub fn list_all_ids(&self) -> Vec<ContainerId> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn fresh_count(&self) -> usize {
        self.state.lock().fresh.len()
    }

    pub fn record(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.state.lock().containers.get(id).cloned()
    }
}

fn log_refill_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        log::error!("background warm task failed, {}", err);
    }
}

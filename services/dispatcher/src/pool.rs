//! Capacity pools for the worker fleet.
//!
//! Two independent pools exist: one tracking staging capacity, one tracking
//! run capacity. Both must be updated on every placement. Reservation here
//! is advisory bookkeeping that biases future placement decisions, not a
//! transactional lock against the worker, and a racing decision elsewhere
//! can oversubscribe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_bus::MessageBus;
use stagehand_id::WorkerId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Subject staging workers advertise capacity on.
pub const STAGING_ADVERTISE_SUBJECT: &str = "staging.advertise";

/// Subject run workers advertise capacity on.
pub const WORKER_ADVERTISE_SUBJECT: &str = "worker.advertise";

/// Periodic capacity advertisement from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAdvertisement {
    pub worker_id: WorkerId,
    pub stacks: Vec<String>,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
}

#[derive(Debug, Clone)]
struct WorkerCapacity {
    stacks: Vec<String>,
    available_memory_mb: u64,
    available_disk_mb: u64,
    running_apps: BTreeSet<String>,
    last_seen: DateTime<Utc>,
}

/// In-memory bookkeeping of per-worker available memory and disk.
pub struct CapacityPool {
    name: &'static str,
    workers: Mutex<BTreeMap<WorkerId, WorkerCapacity>>,
}

impl CapacityPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<WorkerId, WorkerCapacity>> {
        self.workers.lock().expect("capacity pool lock poisoned")
    }

    /// Ingest a worker advertisement, refreshing its capacity.
    pub fn register(&self, ad: WorkerAdvertisement) {
        let mut workers = self.lock();
        let entry = workers.entry(ad.worker_id.clone()).or_insert(WorkerCapacity {
            stacks: Vec::new(),
            available_memory_mb: 0,
            available_disk_mb: 0,
            running_apps: BTreeSet::new(),
            last_seen: Utc::now(),
        });
        entry.stacks = ad.stacks;
        entry.available_memory_mb = ad.available_memory_mb;
        entry.available_disk_mb = ad.available_disk_mb;
        entry.last_seen = Utc::now();
        debug!(
            pool = self.name,
            worker_id = %ad.worker_id,
            available_memory_mb = ad.available_memory_mb,
            available_disk_mb = ad.available_disk_mb,
            "Registered worker advertisement"
        );
    }

    /// Find a worker matching the stack with enough memory and disk.
    ///
    /// Deterministic given identical pool state: prefers the worker with the
    /// most available memory, tie-broken by lexicographic worker id.
    pub fn find_worker(&self, stack: &str, memory_mb: u64, disk_mb: u64) -> Option<WorkerId> {
        let workers = self.lock();
        let mut best: Option<(&WorkerId, &WorkerCapacity)> = None;
        for (id, cap) in workers.iter() {
            if !cap.stacks.iter().any(|s| s == stack) {
                continue;
            }
            if cap.available_memory_mb < memory_mb || cap.available_disk_mb < disk_mb {
                continue;
            }
            // Strict comparison keeps the smallest id on ties (BTreeMap
            // iterates ids in ascending order).
            match best {
                Some((_, best_cap)) if cap.available_memory_mb <= best_cap.available_memory_mb => {}
                _ => best = Some((id, cap)),
            }
        }
        best.map(|(id, _)| id.clone())
    }

    /// Reserve memory on a worker. Advisory; saturates at zero.
    pub fn reserve(&self, worker_id: &WorkerId, memory_mb: u64) {
        let mut workers = self.lock();
        if let Some(cap) = workers.get_mut(worker_id) {
            cap.available_memory_mb = cap.available_memory_mb.saturating_sub(memory_mb);
            debug!(
                pool = self.name,
                worker_id = %worker_id,
                reserved_mb = memory_mb,
                remaining_mb = cap.available_memory_mb,
                "Reserved memory"
            );
        } else {
            warn!(
                pool = self.name,
                worker_id = %worker_id,
                "Reservation against unknown worker"
            );
        }
    }

    /// Record an app as running on a worker.
    pub fn mark_app_started(&self, worker_id: &WorkerId, app_guid: &str) {
        let mut workers = self.lock();
        if let Some(cap) = workers.get_mut(worker_id) {
            cap.running_apps.insert(app_guid.to_string());
        }
    }

    /// Whether the pool knows the app to be running on the worker.
    pub fn app_started_on(&self, worker_id: &WorkerId, app_guid: &str) -> bool {
        self.lock()
            .get(worker_id)
            .is_some_and(|cap| cap.running_apps.contains(app_guid))
    }

    pub fn worker_count(&self) -> usize {
        self.lock().len()
    }
}

/// Background worker feeding advertisements from the bus into a pool.
pub struct AdvertisementListener {
    pool: Arc<CapacityPool>,
    subject: &'static str,
}

impl AdvertisementListener {
    pub fn new(pool: Arc<CapacityPool>, subject: &'static str) -> Self {
        Self { pool, subject }
    }

    /// Run until shutdown is signaled or the transport goes away.
    pub async fn run(&self, bus: Arc<dyn MessageBus>, mut shutdown: watch::Receiver<bool>) {
        let mut sub = match bus.subscribe(self.subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(subject = self.subject, error = %e, "Failed to subscribe for advertisements");
                return;
            }
        };

        info!(subject = self.subject, "Listening for worker advertisements");

        loop {
            tokio::select! {
                msg = sub.next() => {
                    match msg {
                        Some(msg) => match msg.decode::<WorkerAdvertisement>() {
                            Ok(ad) => self.pool.register(ad),
                            Err(e) => {
                                warn!(subject = self.subject, error = %e, "Discarding malformed advertisement");
                            }
                        },
                        None => {
                            info!(subject = self.subject, "Advertisement subscription closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(subject = self.subject, "Advertisement listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

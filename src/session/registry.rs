use super::handle::ClientHandle;
use super::state::ConnectionState;
use crate::error::InitError;
use crate::protocol::ProtoError;
use crate::types::InstanceId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use scopeguard::ScopeGuard;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinSet;

type BuildOutcome = Option<Result<Arc<ClientHandle>, InitError>>;

enum Publish {
    Registered,
    /// The handle was logged out before it could be registered.
    Revoked,
    /// The slot was removed or replaced meanwhile.
    Gone,
}

enum Slot {
    /// A build is in flight; its outcome is broadcast through `done`.
    Building {
        generation: u64,
        done: watch::Receiver<BuildOutcome>,
        /// Set when the slot was taken by a logout.
        logout: Arc<AtomicBool>,
    },
    Ready {
        generation: u64,
        handle: Arc<ClientHandle>,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Building { generation, .. } | Slot::Ready { generation, .. } => *generation,
        }
    }
}

#[derive(Default)]
struct BuildTasks {
    closed: bool,
    tasks: JoinSet<()>,
}

#[derive(Default)]
struct RegistryInner {
    slots: DashMap<InstanceId, Slot>,
    next_generation: AtomicU64,
    builds: Mutex<BuildTasks>,
}

impl RegistryInner {
    fn builds(&self) -> MutexGuard<'_, BuildTasks> {
        self.builds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What [`SessionRegistry::detach_for_logout`] found in the slot.
pub(crate) enum LogoutTarget {
    Idle,
    /// Still registered; logging it out evicts it.
    Ready(Arc<ClientHandle>),
    /// Removed from the registry; the build logs out its handle when done.
    Building(PendingBuild),
}

/// A build whose slot was taken away while it ran.
pub(crate) struct PendingBuild {
    done: watch::Receiver<BuildOutcome>,
}

impl PendingBuild {
    /// Resolves once the build has torn down the handle it produced.
    pub(crate) async fn finished(mut self) {
        let _ = self.done.wait_for(Option::is_some).await;
    }
}

/// Process-wide map from instance id to its live [`ClientHandle`].
///
/// Each id owns one slot, so builds for one id are serialized while different
/// ids proceed concurrently. A slot is either building or ready; callers that
/// arrive during a build attach to it instead of starting another.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ready handle for `instance_id`, if any.
    pub fn get(&self, instance_id: InstanceId) -> Option<Arc<ClientHandle>> {
        self.inner
            .slots
            .get(&instance_id)
            .and_then(|slot| match slot.value() {
                Slot::Ready { handle, .. } => Some(handle.clone()),
                Slot::Building { .. } => None,
            })
    }

    pub fn is_building(&self, instance_id: InstanceId) -> bool {
        self.inner
            .slots
            .get(&instance_id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Building { .. }))
    }

    /// Number of ready handles.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .map(|slot| *slot.key())
            .collect();
        ids.sort();
        ids
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.builds().closed
    }

    /// Returns the handle for `instance_id`, running `factory` to build it if
    /// there is none.
    ///
    /// `factory` runs at most once per id until the handle is removed. It runs
    /// on its own task, so a caller that stops waiting does not cancel the
    /// build for the others. A failed build leaves the slot empty and every
    /// attached caller gets the same error. Once the registry is closed no
    /// new build starts.
    pub async fn get_or_create<F, Fut>(
        &self,
        instance_id: InstanceId,
        factory: F,
    ) -> Result<Arc<ClientHandle>, InitError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<ClientHandle>, InitError>> + Send + 'static,
    {
        let mut done = match self.inner.slots.entry(instance_id) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready { handle, .. } => return Ok(handle.clone()),
                Slot::Building { done, .. } => {
                    debug!("Joining in-flight initialization of instance {instance_id}");
                    done.clone()
                }
            },
            Entry::Vacant(entry) => {
                let mut builds = self.inner.builds();
                if builds.closed {
                    return Err(InitError::ShuttingDown);
                }
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                let logout = Arc::new(AtomicBool::new(false));
                entry.insert(Slot::Building {
                    generation,
                    done: rx.clone(),
                    logout: logout.clone(),
                });
                while builds.tasks.try_join_next().is_some() {}
                builds.tasks.spawn(self.clone().run_build(
                    instance_id,
                    generation,
                    logout,
                    tx,
                    factory,
                ));
                rx
            }
        };

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(InitError::ClientCreationFailed(format!(
                "initialization of instance {instance_id} was abandoned"
            )))
        })
    }

    async fn run_build<F, Fut>(
        self,
        instance_id: InstanceId,
        generation: u64,
        logout: Arc<AtomicBool>,
        done: watch::Sender<BuildOutcome>,
        factory: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<ClientHandle>, InitError>> + Send + 'static,
    {
        // Frees the slot if the build panics or is aborted before reporting.
        let guard = scopeguard::guard(self, move |registry| {
            warn!("Initialization of instance {instance_id} ended without an outcome");
            registry.abandon(instance_id, generation);
        });

        let outcome = factory().await;
        let registry = ScopeGuard::into_inner(guard);

        let outcome = match outcome {
            Ok(handle) => registry.settle(instance_id, generation, &logout, handle).await,
            Err(e) => {
                debug!("Initialization of instance {instance_id} failed: {e}");
                registry.abandon(instance_id, generation);
                Err(e)
            }
        };
        done.send_replace(Some(outcome));
    }

    /// Registers a freshly built handle, or tears it down if its slot is gone.
    async fn settle(
        &self,
        instance_id: InstanceId,
        generation: u64,
        logout: &AtomicBool,
        handle: Arc<ClientHandle>,
    ) -> Result<Arc<ClientHandle>, InitError> {
        match self.publish(instance_id, generation, handle.clone()) {
            Publish::Registered => Ok(handle),
            Publish::Revoked => {
                debug!("Instance {instance_id} was logged out remotely while initializing");
                handle.shutdown().await;
                Err(InitError::Proto(ProtoError::LoggedOut))
            }
            Publish::Gone => {
                if logout.load(Ordering::SeqCst) {
                    debug!("Instance {instance_id} was logged out while initializing");
                    if let Err(e) = handle.logout().await {
                        warn!("Logout of instance {instance_id} after initialization failed: {e}");
                    }
                } else {
                    debug!("Instance {instance_id} was removed while initializing");
                }
                handle.shutdown().await;
                Err(InitError::ClientCreationFailed(format!(
                    "instance {instance_id} was removed during initialization"
                )))
            }
        }
    }

    /// Swaps the building slot of `generation` for a ready one.
    ///
    /// The handle's state is read under the slot lock, the same lock its
    /// session task holds while publishing `LoggedOut`.
    fn publish(&self, instance_id: InstanceId, generation: u64, handle: Arc<ClientHandle>) -> Publish {
        match self.inner.slots.entry(instance_id) {
            Entry::Occupied(mut entry) if entry.get().generation() == generation => {
                if handle.state() == ConnectionState::LoggedOut {
                    entry.remove();
                    Publish::Revoked
                } else {
                    entry.insert(Slot::Ready { generation, handle });
                    Publish::Registered
                }
            }
            _ => Publish::Gone,
        }
    }

    fn abandon(&self, instance_id: InstanceId, generation: u64) {
        self.inner.slots.remove_if(&instance_id, |_, slot| {
            matches!(slot, Slot::Building { .. }) && slot.generation() == generation
        });
    }

    /// Removes whatever occupies the slot. An in-flight build is discarded
    /// when it completes.
    pub fn remove(&self, instance_id: InstanceId) -> Option<Arc<ClientHandle>> {
        self.inner
            .slots
            .remove(&instance_id)
            .and_then(|(_, slot)| match slot {
                Slot::Ready { handle, .. } => Some(handle),
                Slot::Building { .. } => None,
            })
    }

    /// Prepares the slot for a logout. A ready handle stays registered until
    /// its own logout evicts it; an in-flight build is removed and told to
    /// log out what it produces.
    pub(crate) fn detach_for_logout(&self, instance_id: InstanceId) -> LogoutTarget {
        let Entry::Occupied(entry) = self.inner.slots.entry(instance_id) else {
            return LogoutTarget::Idle;
        };
        let done = match entry.get() {
            Slot::Ready { handle, .. } => return LogoutTarget::Ready(handle.clone()),
            Slot::Building { done, logout, .. } => {
                logout.store(true, Ordering::SeqCst);
                done.clone()
            }
        };
        entry.remove();
        LogoutTarget::Building(PendingBuild { done })
    }

    /// Stops new builds and returns the tasks of those still in flight.
    pub(crate) fn close(&self) -> JoinSet<()> {
        let mut builds = self.inner.builds();
        builds.closed = true;
        std::mem::take(&mut builds.tasks)
    }

    /// Empties the registry and returns every ready handle.
    pub fn drain(&self) -> Vec<Arc<ClientHandle>> {
        let ids: Vec<InstanceId> = self.inner.slots.iter().map(|slot| *slot.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }
}

/// Registry reference held by session tasks, so a task never keeps the
/// registry (and with it its own handle) alive.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    /// Removes the handle with `serial` and runs `then` while its slot is
    /// still locked, so nobody sees the handle registered after `then`.
    pub(crate) fn evict_then<F: FnOnce()>(&self, instance_id: InstanceId, serial: u64, then: F) {
        let Some(inner) = self.0.upgrade() else {
            return then();
        };
        match inner.slots.entry(instance_id) {
            Entry::Occupied(entry)
                if matches!(entry.get(), Slot::Ready { handle, .. } if handle.serial() == serial) =>
            {
                then();
                entry.remove();
                debug!("Evicted handle of instance {instance_id}");
            }
            _slot => then(),
        }
    }
}

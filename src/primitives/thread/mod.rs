#![forbid(unsafe_code)]

//! Thread contexts.
//!
//! Every thread that touches a table first obtains a [`ThreadHandle`] from
//! the [`ThreadRegistry`]. The handle carries the thread's epoch slot and its
//! limbo list of deferred reclamations, and is passed explicitly into every
//! table operation. Registration is idempotent per OS thread.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::epoch::{Epoch, EpochCoordinator, EpochGuard, EpochSlot};
use crate::types::{Result, TrieError};

/// Default number of deferred reclamations a thread buffers before it
/// advances the epoch.
pub const DEFAULT_RECLAIM_BATCH: usize = 64;

/// Thread id recorded for the main context.
pub const MAIN_THREAD_ID: usize = usize::MAX;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Role tag of a context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadRole {
    /// The thread that created the table.
    Main,
    /// Any other registered thread.
    Worker,
}

struct Deferred {
    epoch: Epoch,
    reclaim: Box<dyn FnOnce() + Send>,
}

type Limbo = Mutex<Vec<Deferred>>;

/// Shared per-thread state. Callers reach it through a [`ThreadHandle`].
pub struct ThreadContext {
    thread_id: usize,
    role: ThreadRole,
    owner: ThreadId,
    registry_id: u64,
    epochs: Arc<EpochCoordinator>,
    slot: Arc<EpochSlot>,
    limbo: Limbo,
    orphans: Arc<Limbo>,
    reclaim_batch: usize,
    handles: AtomicUsize,
    reclaimed: AtomicU64,
}

impl ThreadContext {
    /// Caller-chosen numeric id ([`MAIN_THREAD_ID`] for the main context).
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Role tag.
    pub fn role(&self) -> ThreadRole {
        self.role
    }

    /// OS thread that owns this context.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Pins the global epoch for the duration of one operation.
    pub fn pin(&self) -> EpochGuard<'_> {
        self.epochs.pin(&self.slot)
    }

    /// Epoch coordinator shared with the other contexts of the registry.
    pub fn epochs(&self) -> &Arc<EpochCoordinator> {
        &self.epochs
    }

    /// Schedules `reclaim` to run once no pinned thread can observe what it
    /// frees. Flushes the limbo when it reaches the batch size.
    pub fn defer<F>(&self, reclaim: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = self.epochs.retire_epoch();
        let pending = {
            let mut limbo = self.limbo.lock();
            limbo.push(Deferred {
                epoch,
                reclaim: Box::new(reclaim),
            });
            limbo.len()
        };
        if pending >= self.reclaim_batch {
            self.collect();
        }
    }

    /// Advances the epoch and runs every deferred reclamation that became
    /// safe, including those left behind by threads that dropped all their
    /// handles. Returns how many ran.
    pub fn collect(&self) -> usize {
        let active = self.epochs.advance();
        let mut ready = drain_ready(&self.limbo, active);
        ready.extend(drain_ready(&self.orphans, active));
        let count = ready.len();
        for deferred in ready {
            (deferred.reclaim)();
        }
        if count > 0 {
            self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
            debug!(
                thread_id = self.thread_id,
                reclaimed = count,
                active = active.0,
                "deferred reclamation ran"
            );
        }
        count
    }

    /// Deferred reclamations still waiting in this thread's limbo.
    pub fn pending(&self) -> usize {
        self.limbo.lock().len()
    }

    /// Total reclamations this thread has run.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    fn release_handle(&self) {
        if self.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut leftovers = std::mem::take(&mut *self.limbo.lock());
            if !leftovers.is_empty() {
                self.orphans.lock().append(&mut leftovers);
            }
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("thread_id", &self.thread_id)
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("pending", &self.pending())
            .finish()
    }
}

fn drain_ready(limbo: &Limbo, active: Epoch) -> Vec<Deferred> {
    let mut guard = limbo.lock();
    if guard.is_empty() {
        return Vec::new();
    }
    let (ready, waiting): (Vec<_>, Vec<_>) = guard.drain(..).partition(|d| d.epoch < active);
    *guard = waiting;
    ready
}

/// Explicit per-thread context handle. Not `Send`: it stays on the thread
/// that registered it.
pub struct ThreadHandle {
    ctx: Arc<ThreadContext>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadHandle {
    fn new(ctx: Arc<ThreadContext>) -> Self {
        ctx.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            ctx,
            _not_send: PhantomData,
        }
    }

    /// Shared context behind the handle.
    pub fn context(&self) -> &ThreadContext {
        &self.ctx
    }

    /// Caller-chosen numeric id.
    pub fn thread_id(&self) -> usize {
        self.ctx.thread_id
    }

    /// Role tag.
    pub fn role(&self) -> ThreadRole {
        self.ctx.role
    }
}

impl Clone for ThreadHandle {
    fn clone(&self) -> Self {
        ThreadHandle::new(Arc::clone(&self.ctx))
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.ctx.release_handle();
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadHandle").field(&*self.ctx).finish()
    }
}

#[derive(Default)]
struct RegistryState {
    by_thread: FxHashMap<ThreadId, Arc<ThreadContext>>,
}

/// Creates and caches one context per OS thread.
pub struct ThreadRegistry {
    id: u64,
    epochs: Arc<EpochCoordinator>,
    reclaim_batch: usize,
    orphans: Arc<Limbo>,
    state: Mutex<RegistryState>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Registry with its own epoch coordinator and the default batch size.
    pub fn new() -> Self {
        Self::build(Arc::new(EpochCoordinator::new()), DEFAULT_RECLAIM_BATCH)
    }

    /// Registry that flushes limbo lists every `reclaim_batch` retirements.
    pub fn with_reclaim_batch(reclaim_batch: usize) -> Result<Self> {
        if reclaim_batch == 0 {
            return Err(TrieError::Invalid("reclaim_batch must be positive"));
        }
        Ok(Self::build(Arc::new(EpochCoordinator::new()), reclaim_batch))
    }

    fn build(epochs: Arc<EpochCoordinator>, reclaim_batch: usize) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            epochs,
            reclaim_batch,
            orphans: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Epoch coordinator shared by every context of this registry.
    pub fn epochs(&self) -> &Arc<EpochCoordinator> {
        &self.epochs
    }

    /// Returns the calling thread's context, creating a worker context tagged
    /// with `thread_id` on first use. Later calls from the same thread return
    /// the existing context unchanged.
    pub fn register(&self, thread_id: usize) -> ThreadHandle {
        self.get_or_create(thread_id, ThreadRole::Worker)
    }

    /// Returns the calling thread's context, creating a main context on first
    /// use.
    pub fn main_context(&self) -> ThreadHandle {
        self.get_or_create(MAIN_THREAD_ID, ThreadRole::Main)
    }

    /// Calling thread's context, if it registered.
    pub fn current(&self) -> Option<ThreadHandle> {
        let me = thread::current().id();
        self.state
            .lock()
            .by_thread
            .get(&me)
            .map(|ctx| ThreadHandle::new(Arc::clone(ctx)))
    }

    /// Calling thread's context.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread never registered.
    pub fn expect_current(&self) -> ThreadHandle {
        match self.current() {
            Some(handle) => handle,
            None => panic!(
                "thread {:?} used the index before registering a thread context",
                thread::current().id()
            ),
        }
    }

    /// Number of contexts created so far.
    pub fn len(&self) -> usize {
        self.state.lock().by_thread.len()
    }

    /// Whether no context has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deferred reclamations abandoned by threads that dropped all handles.
    pub fn orphaned(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Panics unless `handle` was issued by this registry to the calling thread.
    pub fn check(&self, handle: &ThreadHandle) {
        assert!(
            handle.ctx.registry_id == self.id,
            "thread handle {} was issued by a different registry",
            handle.ctx.thread_id
        );
        debug_assert_eq!(
            handle.ctx.owner,
            thread::current().id(),
            "thread handle used off its owning thread"
        );
    }

    fn get_or_create(&self, thread_id: usize, role: ThreadRole) -> ThreadHandle {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(ctx) = state.by_thread.get(&me) {
            return ThreadHandle::new(Arc::clone(ctx));
        }
        let ctx = Arc::new(ThreadContext {
            thread_id,
            role,
            owner: me,
            registry_id: self.id,
            epochs: Arc::clone(&self.epochs),
            slot: self.epochs.register(),
            limbo: Mutex::new(Vec::new()),
            orphans: Arc::clone(&self.orphans),
            reclaim_batch: self.reclaim_batch,
            handles: AtomicUsize::new(0),
            reclaimed: AtomicU64::new(0),
        });
        state.by_thread.insert(me, Arc::clone(&ctx));
        drop(state);
        debug!(thread_id, ?role, "registered thread context");
        ThreadHandle::new(ctx)
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("id", &self.id)
            .field("contexts", &self.len())
            .field("reclaim_batch", &self.reclaim_batch)
            .finish()
    }
}

//! Context thread local
//!
//! Records which context the calling thread has currently entered.
//!
//! The first thread that binds a value owns a dedicated atomic slot and never
//! touches shared structures. As soon as a second thread binds a value the
//! local is flagged multi-threaded for the rest of its life; the owner keeps
//! its slot and every other thread uses a per-thread map. Each thread only
//! ever writes its own storage, so no lock is involved on either path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT_THREAD_KEY: ThreadKey =
        ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));

    /// Dropped when the thread exits
    static LIVENESS: Arc<()> = Arc::new(());

    /// Bindings of locals this thread does not own, keyed by local id
    static FOREIGN_BINDINGS: RefCell<HashMap<u64, ContextId>> = RefCell::new(HashMap::new());
}

/// Process-unique identity of an OS thread. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(u64);

impl ThreadKey {
    pub fn current() -> Self {
        CURRENT_THREAD_KEY.with(|key| *key)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Token of the current thread that dangles once the thread has exited
    pub(crate) fn liveness() -> Weak<()> {
        LIVENESS.with(Arc::downgrade)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread[#{}]", self.0)
    }
}

/// Process-unique identity of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(NonZeroU64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NonZeroU64::MIN.saturating_add(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    fn encode(value: Option<Self>) -> u64 {
        value.map_or(0, Self::as_u64)
    }

    fn decode(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context[#{}]", self.0)
    }
}

/// Thread to entered-context binding shared by all contexts of an engine
pub struct ContextThreadLocal {
    id: u64,
    /// Key of the thread owning `fast`, 0 while unclaimed
    owner: CachePadded<AtomicU64>,
    /// Binding of the owner thread; only the owner reads or writes it
    fast: CachePadded<AtomicU64>,
    multi_threaded: AtomicBool,
}

impl fmt::Debug for ContextThreadLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextThreadLocal")
            .field("id", &self.id)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("single_threaded", &self.is_single_threaded())
            .finish()
    }
}

impl Default for ContextThreadLocal {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextThreadLocal {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            owner: CachePadded::new(AtomicU64::new(0)),
            fast: CachePadded::new(AtomicU64::new(0)),
            multi_threaded: AtomicBool::new(false),
        }
    }

    /// True while at most one thread has ever bound a value
    pub fn is_single_threaded(&self) -> bool {
        !self.multi_threaded.load(Ordering::Acquire)
    }

    /// The context the calling thread has entered, if any
    pub fn get(&self) -> Option<ContextId> {
        let me = ThreadKey::current().as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            ContextId::decode(self.fast.load(Ordering::Relaxed))
        } else {
            FOREIGN_BINDINGS.with(|bindings| bindings.borrow().get(&self.id).copied())
        }
    }

    /// Bind `value` for the calling thread and return the binding it
    /// displaced. Pass the returned value to [`Self::restore`] to undo.
    pub fn push(&self, value: ContextId) -> Option<ContextId> {
        self.replace(Some(value))
    }

    /// Put back a binding returned by [`Self::push`]
    pub fn restore(&self, previous: Option<ContextId>) {
        self.replace(previous);
    }

    fn replace(&self, value: Option<ContextId>) -> Option<ContextId> {
        let me = ThreadKey::current().as_u64();
        if self.claim(me) {
            let raw = self.fast.swap(ContextId::encode(value), Ordering::Relaxed);
            return ContextId::decode(raw);
        }
        FOREIGN_BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            match value {
                Some(value) => bindings.insert(self.id, value),
                None => bindings.remove(&self.id),
            }
        })
    }

    /// Whether `me` owns the fast slot, claiming it if still free
    fn claim(&self, me: u64) -> bool {
        match self.owner.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(owner) if owner == me => true,
            Err(_) => {
                if !self.multi_threaded.swap(true, Ordering::AcqRel) {
                    tracing::debug!(local = self.id, "context thread local is now multi-threaded");
                }
                false
            }
        }
    }
}

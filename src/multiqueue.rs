//! A set of FIFO subqueues drained as one logical queue.
//!
//! Draining is either fair (round-robin over non-empty subqueues) or unfair
//! (the first-created non-empty subqueue is drained dry before any later
//! one). The add side and the remove side can be disabled independently;
//! shutdown is a stronger, terminal disable that drains every subqueue and
//! runs the optional residual-element destructor chosen at construction. A
//! subqueue can be migrated between multiqueues atomically with respect to
//! concurrent push/get.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Fair,
    Unfair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The relevant side (add or remove) is currently disabled.
    Disabled,
    /// The multiqueue was shut down; terminal.
    Shutdown,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Disabled => write!(f, "queue disabled"),
            QueueError::Shutdown => write!(f, "queue shut down"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A push that was refused; the element is handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub reason: QueueError,
    pub item: T,
}

struct Sub<T> {
    id: u64,
    items: VecDeque<T>,
}

struct State<T> {
    subs: Vec<Sub<T>>,
    /// Index of the next subqueue to try first when draining fairly.
    cursor: usize,
    add_enabled: bool,
    remove_enabled: bool,
    shutdown: bool,
}

/// Cleanup applied to every element still queued when the multiqueue shuts
/// down.
pub type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

struct Shared<T> {
    order: Order,
    state: Mutex<State<T>>,
    notify: Notify,
    destructor: Option<Destructor<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Multiqueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Multiqueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Handle to one subqueue. The handle stays valid across migration to
/// another multiqueue; pushes always land in the current owner.
pub struct Subqueue<T> {
    id: u64,
    owner: Arc<Mutex<Arc<Shared<T>>>>,
}

impl<T> Clone for Subqueue<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            owner: Arc::clone(&self.owner),
        }
    }
}

impl<T> Multiqueue<T> {
    pub fn new(order: Order) -> Self {
        Self::build(order, None)
    }

    /// Like [`Multiqueue::new`], with a destructor run over every element
    /// still queued when [`Multiqueue::shutdown`] fires.
    pub fn with_destructor(order: Order, destructor: Destructor<T>) -> Self {
        Self::build(order, Some(destructor))
    }

    fn build(order: Order, destructor: Option<Destructor<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                order,
                state: Mutex::new(State {
                    subs: Vec::new(),
                    cursor: 0,
                    add_enabled: true,
                    remove_enabled: true,
                    shutdown: false,
                }),
                notify: Notify::new(),
                destructor,
            }),
        }
    }

    /// Create a new subqueue attached to this multiqueue. Creation order is
    /// the drain order under `Order::Unfair`.
    pub fn subqueue(&self) -> Subqueue<T> {
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.lock();
        st.subs.push(Sub {
            id,
            items: VecDeque::new(),
        });
        Subqueue {
            id,
            owner: Arc::new(Mutex::new(Arc::clone(&self.shared))),
        }
    }

    /// Move `sub` (and everything queued on it) out of its current owner and
    /// into this multiqueue, atomically with respect to concurrent push/get.
    pub fn adopt(&self, sub: &Subqueue<T>) {
        let dst = Arc::clone(&self.shared);
        loop {
            let src = {
                let owner = sub.owner.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(&owner)
            };
            if Arc::ptr_eq(&src, &dst) {
                return;
            }

            // Lock both states in address order so concurrent adopts in the
            // opposite direction cannot deadlock.
            let (mut first, mut second) = if Arc::as_ptr(&src) < Arc::as_ptr(&dst) {
                (src.lock(), dst.lock())
            } else {
                (dst.lock(), src.lock())
            };
            let (src_st, dst_st) = if Arc::as_ptr(&src) < Arc::as_ptr(&dst) {
                (&mut *first, &mut *second)
            } else {
                (&mut *second, &mut *first)
            };

            let mut owner = sub.owner.lock().unwrap_or_else(PoisonError::into_inner);
            if !Arc::ptr_eq(&owner, &src) {
                // Someone moved it while we were acquiring locks.
                continue;
            }

            if let Some(pos) = src_st.subs.iter().position(|s| s.id == sub.id) {
                let entry = src_st.subs.remove(pos);
                if src_st.cursor > pos {
                    src_st.cursor -= 1;
                }
                if src_st.cursor >= src_st.subs.len() {
                    src_st.cursor = 0;
                }
                let had_items = !entry.items.is_empty();
                dst_st.subs.push(entry);
                *owner = Arc::clone(&dst);
                drop(owner);
                drop(first);
                drop(second);
                if had_items {
                    dst.notify.notify_one();
                }
            }
            return;
        }
    }

    /// Detach a subqueue, returning whatever was still queued on it.
    pub fn detach(&self, sub: &Subqueue<T>) -> Vec<T> {
        let mut st = self.shared.lock();
        if let Some(pos) = st.subs.iter().position(|s| s.id == sub.id) {
            let entry = st.subs.remove(pos);
            if st.cursor > pos {
                st.cursor -= 1;
            }
            if st.cursor >= st.subs.len() {
                st.cursor = 0;
            }
            entry.items.into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Block until an element is available, the remove side is disabled, or
    /// the multiqueue is shut down.
    pub async fn get(&self) -> Result<T, QueueError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut st = self.shared.lock();
                if st.shutdown {
                    return Err(QueueError::Shutdown);
                }
                if !st.remove_enabled {
                    return Err(QueueError::Disabled);
                }
                if let Some(item) = Self::pop_locked(&mut st, self.shared.order) {
                    // Chain the wakeup so a second waiter sees remaining work.
                    if st.subs.iter().any(|s| !s.items.is_empty()) {
                        self.shared.notify.notify_one();
                    }
                    return Ok(item);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`Multiqueue::get`].
    pub fn try_get(&self) -> Result<Option<T>, QueueError> {
        let mut st = self.shared.lock();
        if st.shutdown {
            return Err(QueueError::Shutdown);
        }
        if !st.remove_enabled {
            return Err(QueueError::Disabled);
        }
        Ok(Self::pop_locked(&mut st, self.shared.order))
    }

    fn pop_locked(st: &mut State<T>, order: Order) -> Option<T> {
        if st.subs.is_empty() {
            return None;
        }
        match order {
            Order::Unfair => st
                .subs
                .iter_mut()
                .find(|s| !s.items.is_empty())
                .and_then(|s| s.items.pop_front()),
            Order::Fair => {
                let n = st.subs.len();
                let start = st.cursor.min(n - 1);
                for step in 0..n {
                    let idx = (start + step) % n;
                    if let Some(item) = st.subs[idx].items.pop_front() {
                        st.cursor = (idx + 1) % n;
                        return Some(item);
                    }
                }
                None
            }
        }
    }

    pub fn set_add_enabled(&self, enabled: bool) {
        let mut st = self.shared.lock();
        if !st.shutdown {
            st.add_enabled = enabled;
        }
    }

    /// Disabling the remove side unblocks every waiting getter with
    /// [`QueueError::Disabled`].
    pub fn set_remove_enabled(&self, enabled: bool) {
        let mut st = self.shared.lock();
        if st.shutdown {
            return;
        }
        st.remove_enabled = enabled;
        drop(st);
        if enabled {
            self.shared.notify.notify_one();
        } else {
            self.shared.notify.notify_waiters();
        }
    }

    /// Terminal disable of both sides; wakes every waiter. Every residual
    /// element is drained right here, through the construction-time
    /// destructor when one was given.
    pub fn shutdown(&self) {
        let residual: Vec<T> = {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.add_enabled = false;
            st.remove_enabled = false;
            st.subs
                .iter_mut()
                .flat_map(|s| s.items.drain(..))
                .collect()
        };
        self.shared.notify.notify_waiters();
        for item in residual {
            match &self.shared.destructor {
                Some(destroy) => destroy(item),
                None => drop(item),
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Total elements across all subqueues.
    pub fn len(&self) -> usize {
        self.shared.lock().subs.iter().map(|s| s.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Subqueue<T> {
    fn push(&self, item: T, front: bool) -> Result<(), Rejected<T>> {
        loop {
            let owner = {
                let guard = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(&guard)
            };
            {
                let mut st = owner.lock();
                if st.shutdown {
                    return Err(Rejected {
                        reason: QueueError::Shutdown,
                        item,
                    });
                }
                if !st.add_enabled {
                    return Err(Rejected {
                        reason: QueueError::Disabled,
                        item,
                    });
                }
                if let Some(sub) = st.subs.iter_mut().find(|s| s.id == self.id) {
                    if front {
                        sub.items.push_front(item);
                    } else {
                        sub.items.push_back(item);
                    }
                    drop(st);
                    owner.notify.notify_one();
                    return Ok(());
                }
            }
            // Not found under the owner we read: either the subqueue moved
            // while we were locking (retry against the new owner) or it was
            // detached (refuse the push).
            let guard = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&guard, &owner) {
                return Err(Rejected {
                    reason: QueueError::Disabled,
                    item,
                });
            }
        }
    }

    pub fn push_back(&self, item: T) -> Result<(), Rejected<T>> {
        self.push(item, false)
    }

    /// Requeue at the head, ahead of everything else on this subqueue.
    pub fn push_front(&self, item: T) -> Result<(), Rejected<T>> {
        self.push(item, true)
    }

    pub fn len(&self) -> usize {
        let owner = {
            let guard = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(&guard)
        };
        let st = owner.lock();
        st.subs
            .iter()
            .find(|s| s.id == self.id)
            .map(|s| s.items.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

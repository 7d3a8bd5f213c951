use crate::platform::{Listener, MaybeSend, SharedPtr};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when an observer is registered, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct Slot<A> {
    id: ListenerId,
    once: bool,
    listener: SharedPtr<Mutex<Listener<A>>>,
}

/// Registry of callbacks for one kind of stream signal.
///
/// Emission works on a snapshot, so listeners may register or remove
/// listeners (including themselves) while being called. A listener removed
/// mid-emission still sees the signal that is being delivered.
pub(crate) struct Observers<A> {
    slots: Mutex<Vec<Slot<A>>>,
}

impl<A: Clone> Observers<A> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Listener<A>) -> ListenerId {
        self.insert(listener, false)
    }

    pub(crate) fn add_once(&self, listener: Listener<A>) -> ListenerId {
        self.insert(listener, true)
    }

    fn insert(&self, listener: Listener<A>, once: bool) -> ListenerId {
        let id = ListenerId::next();
        self.slots.lock().push(Slot {
            id,
            once,
            listener: SharedPtr::new(Mutex::new(listener)),
        });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Call every registered listener, returning how many were called.
    pub(crate) fn emit(&self, arg: A) -> usize {
        let snapshot: Vec<_> = {
            let mut slots = self.slots.lock();
            let snapshot = slots.iter().map(|slot| slot.listener.clone()).collect();
            slots.retain(|slot| !slot.once);
            snapshot
        };

        let count = snapshot.len();
        let mut arg = Some(arg);
        for (index, listener) in snapshot.iter().enumerate() {
            let value = if index + 1 == count {
                arg.take()
            } else {
                arg.clone()
            };
            if let Some(value) = value {
                let mut callback = listener.lock();
                (&mut *callback)(value);
            }
        }
        count
    }
}

/// Adapt a one-shot callback to the listener shape used by `add_once`.
pub(crate) fn once_listener<A, F>(f: F) -> Listener<A>
where
    A: 'static,
    F: FnOnce(A) + MaybeSend + 'static,
{
    let mut f = Some(f);
    Box::new(move |arg| {
        if let Some(f) = f.take() {
            f(arg)
        }
    })
}

/// Tasks parked on a stream's state, woken together on every change.
#[derive(Default)]
pub(crate) struct WakerSet {
    wakers: Mutex<Vec<Waker>>,
}

impl WakerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park `waker` unless a waker for the same task is already parked.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if wakers.iter().all(|parked| !parked.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake and forget every parked task, returning how many there were.
    pub(crate) fn wake_all(&self) -> usize {
        let wakers = std::mem::take(&mut *self.wakers.lock());
        let count = wakers.len();
        wakers.into_iter().for_each(Waker::wake);
        count
    }
}

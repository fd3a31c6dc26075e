//! Per-task change subscriptions.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use taskforge_core::{Task, TaskId};

/// Callback invoked with the task record after every change.
pub type TaskCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Token identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Tracks whether a callback may still start and which threads are inside it.
#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    running: Vec<ThreadId>,
}

impl Gate {
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the current thread as running the callback; false once closed.
    fn enter(&self) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.running.push(thread::current().id());
        true
    }

    fn leave(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        if let Some(pos) = state.running.iter().position(|t| *t == me) {
            state.running.swap_remove(pos);
        }
        drop(state);
        self.idle.notify_all();
    }

    /// Refuse new invocations and wait out those running on other threads.
    fn close(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        state.closed = true;
        let _state = self
            .idle
            .wait_while(state, |s| s.running.iter().any(|t| *t != me))
            .unwrap_or_else(PoisonError::into_inner);
    }
}

struct Entry {
    id: SubscriptionId,
    gate: Arc<Gate>,
    callback: TaskCallback,
}

#[derive(Default)]
struct HubInner {
    entries: RwLock<HashMap<TaskId, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// In-memory registry of callbacks keyed by task id.
///
/// Notification is synchronous and in registration order. The callback list
/// is copied before any callback runs, so callbacks may freely subscribe or
/// unsubscribe (even themselves) while being notified. Once a terminal
/// record has been delivered the task's callbacks are dropped.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, task_id: TaskId, callback: F) -> Subscription
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let gate = Arc::new(Gate::default());

        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id)
            .or_default()
            .push(Entry {
                id,
                gate: gate.clone(),
                callback: Arc::new(callback),
            });

        Subscription {
            hub: Arc::downgrade(&self.inner),
            task_id,
            id,
            gate,
        }
    }

    /// Invoke every callback currently registered for `task.id`.
    pub fn notify(&self, task: &Task) {
        let snapshot: Vec<(SubscriptionId, Arc<Gate>, TaskCallback)> = {
            let entries = self
                .inner
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match entries.get(&task.id) {
                Some(list) => list
                    .iter()
                    .map(|e| (e.id, e.gate.clone(), e.callback.clone()))
                    .collect(),
                None => return,
            }
        };

        for (id, gate, callback) in snapshot {
            if !gate.enter() {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(task)));
            gate.leave();
            if outcome.is_err() {
                tracing::warn!(task_id = %task.id, subscription = %id, "subscriber panicked");
            }
        }

        if task.is_terminal() {
            self.inner
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task.id);
        }
    }

    /// Number of live callbacks for a task.
    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .map_or(0, Vec::len)
    }
}

impl core::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tasks = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("SubscriptionHub").field("tasks", &tasks).finish()
    }
}

/// Handle returned by [`SubscriptionHub::subscribe`].
///
/// Dropping the handle keeps the callback registered until the task reaches
/// a terminal state; call [`Subscription::unsubscribe`] to remove it sooner.
#[derive(Debug)]
pub struct Subscription {
    hub: Weak<HubInner>,
    task_id: TaskId,
    id: SubscriptionId,
    gate: Arc<Gate>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Remove the callback.
    ///
    /// Blocks until invocations running on other threads have returned, so
    /// the callback never runs after this returns. Called from inside a
    /// callback, only the invocation on the current thread may still finish.
    pub fn unsubscribe(self) {
        self.gate.close();

        let Some(inner) = self.hub.upgrade() else {
            return;
        };
        let mut entries = inner.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = entries.get_mut(&self.task_id) {
            list.retain(|e| e.id != self.id);
            if list.is_empty() {
                entries.remove(&self.task_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;
    use taskforge_core::{OwnerId, Payload};

    fn task() -> Task {
        Task::pending(
            OwnerId::new("alice").unwrap(),
            "echo",
            Payload::new(),
            Payload::new(),
        )
        .unwrap()
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let hub = SubscriptionHub::new();
        let task = task();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let calls = calls.clone();
            hub.subscribe(task.id, move |_| calls.lock().unwrap().push(n));
        }
        hub.notify(&task);

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let hub = SubscriptionHub::new();
        let task = task();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let calls = calls.clone();
            hub.subscribe(task.id, move |_| calls.lock().unwrap().push("first"))
        };
        let _second = {
            let calls = calls.clone();
            hub.subscribe(task.id, move |_| calls.lock().unwrap().push("second"))
        };

        first.unsubscribe();
        hub.notify(&task);

        assert_eq!(*calls.lock().unwrap(), vec!["second"]);
        assert_eq!(hub.subscriber_count(task.id), 1);
    }

    #[test]
    fn empty_lists_are_collected() {
        let hub = SubscriptionHub::new();
        let task = task();

        let sub = hub.subscribe(task.id, |_| {});
        assert_eq!(hub.subscriber_count(task.id), 1);
        sub.unsubscribe();

        assert_eq!(hub.subscriber_count(task.id), 0);
        assert!(hub.inner.entries.read().unwrap().is_empty());
    }

    #[test]
    fn callback_may_unsubscribe_a_later_callback() {
        let hub = SubscriptionHub::new();
        let task = task();
        let later_calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        {
            let slot = slot.clone();
            hub.subscribe(task.id, move |_| {
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            });
        }
        let later = {
            let later_calls = later_calls.clone();
            hub.subscribe(task.id, move |_| {
                later_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        *slot.lock().unwrap() = Some(later);

        hub.notify(&task);
        hub.notify(&task);

        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.subscriber_count(task.id), 1);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let hub = SubscriptionHub::new();
        let task = task();
        let reached = Arc::new(AtomicBool::new(false));

        hub.subscribe(task.id, |_| panic!("boom"));
        {
            let reached = reached.clone();
            hub.subscribe(task.id, move |_| reached.store(true, Ordering::SeqCst));
        }
        hub.notify(&task);

        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn other_tasks_are_not_notified() {
        let hub = SubscriptionHub::new();
        let watched = task();
        let other = task();
        let hits = Arc::new(AtomicU64::new(0));

        {
            let hits = hits.clone();
            hub.subscribe(watched.id, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        hub.notify(&other);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let hub = SubscriptionHub::new();
        let task = task();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sub = {
            let (calls, slot) = (calls.clone(), slot.clone());
            hub.subscribe(task.id, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        hub.notify(&task);
        hub.notify(&task);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(task.id), 0);
    }

    #[test]
    fn unsubscribe_waits_for_a_callback_running_elsewhere() {
        let hub = SubscriptionHub::new();
        let task = task();
        let calls = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let sub = {
            let (calls, finished) = (calls.clone(), finished.clone());
            hub.subscribe(task.id, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = entered_tx.send(());
                let _ = release_rx.lock().unwrap().recv();
                finished.store(true, Ordering::SeqCst);
            })
        };

        let notifier = {
            let (hub, task) = (hub.clone(), task.clone());
            thread::spawn(move || hub.notify(&task))
        };
        entered_rx.recv().unwrap();

        let unsubscriber = thread::spawn(move || sub.unsubscribe());
        thread::sleep(Duration::from_millis(50));
        assert!(!unsubscriber.is_finished(), "must wait for the running callback");

        release_tx.send(()).unwrap();
        unsubscriber.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        notifier.join().unwrap();

        drop(release_tx);
        hub.notify(&task);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_notice_drops_the_task_callbacks() {
        let hub = SubscriptionHub::new();
        let mut task = task();
        let calls = Arc::new(AtomicU64::new(0));

        {
            let calls = calls.clone();
            hub.subscribe(task.id, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        task.mark_running().unwrap();
        hub.notify(&task);
        assert_eq!(hub.subscriber_count(task.id), 1);

        task.mark_completed(None).unwrap();
        hub.notify(&task);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(hub.subscriber_count(task.id), 0);
        assert!(hub.inner.entries.read().unwrap().is_empty());
    }
}

//! Poisonable one-shot events and continuation scheduling.
//!
//! An [`Event`] either does not exist (the pre-triggered sentinel), is
//! pending, or has triggered exactly once, possibly poisoned. Cancellation
//! propagates by triggering with the poison flag set; merged events carry
//! poison if any constituent was poisoned.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

type Continuation = Box<dyn FnOnce(bool) + Send>;

#[derive(Default)]
struct EventState {
    triggered: bool,
    poisoned: bool,
    waiters: Vec<Continuation>,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// One-shot event handle. Cloning shares the same trigger.
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    /// The no-event sentinel, treated as already triggered and clean.
    pub const NO_EVENT: Self = Self { inner: None };

    /// Whether this handle names a real event.
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether the event has fired (the sentinel counts as fired).
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.state.lock().triggered,
        }
    }

    /// Whether the event fired poisoned. Pending events answer `false`.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let state = inner.state.lock();
                state.triggered && state.poisoned
            }
        }
    }

    /// Block the calling thread until the event fires; returns the poison
    /// flag. Only test harnesses and top-of-stack dispatch may call this;
    /// analysis code schedules continuations with [`defer`] instead.
    pub fn wait(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let mut state = inner.state.lock();
        while !state.triggered {
            inner.cond.wait(&mut state);
        }
        state.poisoned
    }

    /// Run `continuation` once the event fires, passing the poison flag.
    /// Runs inline if the event already fired.
    pub fn subscribe(&self, continuation: impl FnOnce(bool) + Send + 'static) {
        let Some(inner) = &self.inner else {
            continuation(false);
            return;
        };
        let run_now = {
            let mut state = inner.state.lock();
            if state.triggered {
                Some(state.poisoned)
            } else {
                state.waiters.push(Box::new(continuation));
                return;
            }
        };
        if let Some(poisoned) = run_now {
            continuation(poisoned);
        }
    }
}

/// A triggerable event. The owner fires it exactly once.
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Create a fresh pending event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event: Event {
                inner: Some(Arc::new(EventInner {
                    state: Mutex::new(EventState::default()),
                    cond: Condvar::new(),
                })),
            },
        }
    }

    /// The waitable handle for this event.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Fire the event. `poisoned` marks a cancelled producer.
    ///
    /// Double-triggering is a caller bug and panics in debug builds; in
    /// release the second trigger is ignored.
    pub fn trigger(self, poisoned: bool) {
        let inner = self.event.inner.as_ref().unwrap();
        let waiters = {
            let mut state = inner.state.lock();
            debug_assert!(!state.triggered, "event triggered twice");
            if state.triggered {
                return;
            }
            state.triggered = true;
            state.poisoned = poisoned;
            inner.cond.notify_all();
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(poisoned);
        }
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a set of events into one that fires when all have fired.
///
/// Poison accumulates: the merged event is poisoned iff any constituent
/// fired poisoned. Merging zero real events yields the sentinel.
#[must_use]
pub fn merge_events<I: IntoIterator<Item = Event>>(events: I) -> Event {
    let pending: Vec<Event> = events.into_iter().filter(Event::exists).collect();
    if pending.is_empty() {
        return Event::NO_EVENT;
    }
    if pending.len() == 1 {
        return pending.into_iter().next().unwrap();
    }
    let merged = UserEvent::new();
    let result = merged.event();
    let remaining = Arc::new(Mutex::new((pending.len(), false, Some(merged))));
    for event in pending {
        let remaining = Arc::clone(&remaining);
        event.subscribe(move |poisoned| {
            let fire = {
                let mut guard = remaining.lock();
                guard.0 -= 1;
                guard.1 |= poisoned;
                if guard.0 == 0 {
                    Some((guard.2.take().unwrap(), guard.1))
                } else {
                    None
                }
            };
            if let Some((user_event, any_poisoned)) = fire {
                user_event.trigger(any_poisoned);
            }
        });
    }
    result
}

/// Schedule `task` to run once `precondition` fires (inline if it already
/// has). The continuation receives the poison flag.
pub fn defer(precondition: &Event, task: impl FnOnce(bool) + Send + 'static) {
    precondition.subscribe(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_no_event_is_triggered_and_clean() {
        let event = Event::NO_EVENT;
        assert!(!event.exists());
        assert!(event.has_triggered());
        assert!(!event.is_poisoned());
        assert!(!event.wait());
    }

    #[test]
    fn test_trigger_wakes_subscribers_in_order() {
        let user = UserEvent::new();
        let event = user.event();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            event.subscribe(move |poisoned| {
                assert!(!poisoned);
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        user.trigger(false);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(event.has_triggered());
    }

    #[test]
    fn test_subscribe_after_trigger_runs_inline() {
        let user = UserEvent::new();
        let event = user.event();
        user.trigger(true);
        let saw_poison = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_poison);
        event.subscribe(move |poisoned| flag.store(poisoned, Ordering::SeqCst));
        assert!(saw_poison.load(Ordering::SeqCst));
        assert!(event.is_poisoned());
    }

    #[test]
    fn test_merge_accumulates_poison() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = merge_events([a.event(), b.event(), Event::NO_EVENT]);
        assert!(!merged.has_triggered());
        a.trigger(false);
        assert!(!merged.has_triggered());
        b.trigger(true);
        assert!(merged.has_triggered());
        assert!(merged.is_poisoned());
    }

    #[test]
    fn test_merge_of_nothing_is_sentinel() {
        assert!(!merge_events(std::iter::empty()).exists());
        assert!(!merge_events([Event::NO_EVENT, Event::NO_EVENT]).exists());
    }

    #[test]
    fn test_wait_across_threads() {
        let user = UserEvent::new();
        let event = user.event();
        let handle = std::thread::spawn(move || event.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        user.trigger(false);
        assert!(!handle.join().unwrap());
    }
}

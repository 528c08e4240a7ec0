//! Single-shot promise/future pair.
//!
//! [`promise()`] hands back the consumer half ([`Promise`]) and the producer
//! half ([`Resolver`]). The resolver is consumed by `resolve` or `reject`,
//! so a value is produced at most once. The promise side offers three ways
//! to consume the outcome, whichever fits the calling context:
//!
//! - `await` it (implements [`Future`]),
//! - block on it with [`Promise::wait`] / [`Promise::wait_timeout`],
//! - chain a continuation with [`Promise::then`], which runs inline on the
//!   resolving thread.
//!
//! Continuations and wakeups run with no internal lock held — a terminal
//! callback may re-enter arbitrary code, including code that creates and
//! resolves further promises.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Callback<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

enum State<T: 'static, E: 'static> {
    Pending {
        waker: Option<Waker>,
        then: Option<Callback<T, E>>,
    },
    Complete(Option<Result<T, E>>),
}

struct Shared<T: 'static, E: 'static> {
    state: Mutex<State<T, E>>,
    cond: Condvar,
}

impl<T: 'static, E: 'static> Shared<T, E> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected promise/resolver pair.
pub fn promise<T: 'static, E: 'static>() -> (Promise<T, E>, Resolver<T, E>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            waker: None,
            then: None,
        }),
        cond: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Resolver { shared },
    )
}

/// Producer half: resolves or rejects exactly once.
pub struct Resolver<T: 'static, E: 'static> {
    shared: Arc<Shared<T, E>>,
}

impl<T: 'static, E: 'static> Resolver<T, E> {
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(self, error: E) {
        self.complete(Err(error));
    }

    fn complete(self, result: Result<T, E>) {
        let mut guard = self.shared.lock();
        let (waker, then) = match &mut *guard {
            State::Pending { waker, then } => (waker.take(), then.take()),
            // The resolver is consumed on completion, so this is unreachable.
            State::Complete(_) => return,
        };
        if let Some(callback) = then {
            *guard = State::Complete(None);
            drop(guard);
            callback(result);
            return;
        }
        *guard = State::Complete(Some(result));
        drop(guard);
        if let Some(waker) = waker {
            waker.wake();
        }
        self.shared.cond.notify_all();
    }
}

/// Consumer half of a [`promise()`] pair.
pub struct Promise<T: 'static, E: 'static> {
    shared: Arc<Shared<T, E>>,
}

impl<T: 'static, E: 'static> Promise<T, E> {
    /// Attach a continuation. Runs immediately if the outcome is already
    /// known, otherwise inline on the thread that later resolves.
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        let mut guard = self.shared.lock();
        match &mut *guard {
            State::Pending { then, .. } => {
                *then = Some(Box::new(f));
            }
            State::Complete(result) => {
                let result = result.take();
                drop(guard);
                if let Some(result) = result {
                    f(result);
                }
            }
        }
    }

    /// Block until the outcome is available.
    pub fn wait(self) -> Result<T, E> {
        let mut guard = self.shared.lock();
        loop {
            if let State::Complete(result) = &mut *guard {
                if let Some(result) = result.take() {
                    return result;
                }
            }
            guard = self
                .shared
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the outcome is available or the timeout elapses.
    /// Returns `None` on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.lock();
        loop {
            if let State::Complete(result) = &mut *guard {
                return result.take();
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self
                .shared
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
    }
}

impl<T: 'static, E: 'static> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.shared.lock();
        match &mut *guard {
            State::Complete(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => panic!("promise polled after completion"),
            },
            State::Pending { waker, .. } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn resolve_then_wait() {
        let (p, r) = promise::<u32, &'static str>();
        r.resolve(42);
        assert_eq!(p.wait(), Ok(42));
    }

    #[test]
    fn reject_then_wait() {
        let (p, r) = promise::<u32, &'static str>();
        r.reject("boom");
        assert_eq!(p.wait(), Err("boom"));
    }

    #[test]
    fn wait_blocks_for_cross_thread_resolve() {
        let (p, r) = promise::<String, ()>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.resolve("done".to_string());
        });
        assert_eq!(p.wait(), Ok("done".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_when_unresolved() {
        let (p, _r) = promise::<u32, ()>();
        assert!(p.wait_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn then_runs_inline_on_resolving_thread() {
        let (p, r) = promise::<u32, ()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        p.then(move |result| {
            assert_eq!(result, Ok(7));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!fired.load(Ordering::SeqCst));
        r.resolve(7);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn then_after_completion_runs_immediately() {
        let (p, r) = promise::<u32, ()>();
        r.resolve(9);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        p.then(move |result| {
            assert_eq!(result, Ok(9));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn continuation_may_resolve_another_promise() {
        let (outer, outer_r) = promise::<u32, ()>();
        let (inner, inner_r) = promise::<u32, ()>();
        outer.then(move |result| {
            if let Ok(v) = result {
                inner_r.resolve(v + 1);
            }
        });
        outer_r.resolve(1);
        assert_eq!(inner.wait(), Ok(2));
    }
}

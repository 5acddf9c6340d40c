//! View lifetimes: cancellation for everything a mounted view starts.
//!
//! A view creates a [`ViewScope`] when it mounts. Every timer, task, fetch
//! or channel the view owns runs through the scope's [`ScopeToken`], so
//! unmounting (explicitly or by dropping the `ViewScope`) stops all of it.
//! [`ViewState`] holds the view's fetched data and refuses updates that
//! arrive after unmount or from a fetch that has been superseded.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::GatewayError;

struct ScopeInner {
    unmounted_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable view of a scope's lifetime.
///
/// Tokens can wait, spawn and check liveness but cannot end the scope;
/// only the owning [`ViewScope`] can.
#[derive(Clone)]
pub struct ScopeToken {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeToken")
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

impl ScopeToken {
    /// Returns `true` until the owning view unmounts.
    pub fn is_mounted(&self) -> bool {
        !*self.inner.unmounted_tx.borrow()
    }

    /// Resolves once the owning view unmounts.
    pub async fn unmounted(&self) {
        let mut rx = self.inner.unmounted_tx.subscribe();
        // The sender lives in `self.inner`, so the channel cannot close here.
        let _ = rx.wait_for(|unmounted| *unmounted).await;
    }

    /// Drive `fut` until it completes or the view unmounts.
    ///
    /// # Returns
    ///
    /// `Some(output)` if `fut` finished first, `None` if the view unmounted
    /// (in which case `fut` is dropped mid-flight).
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        if !self.is_mounted() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.unmounted() => None,
            out = fut => Some(out),
        }
    }

    /// Sleep for `duration` unless the view unmounts first.
    ///
    /// # Returns
    ///
    /// `true` if the full duration elapsed while mounted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.run(tokio::time::sleep(duration)).await.is_some()
    }

    /// Spawn a task owned by the view.
    ///
    /// The task is aborted when the view unmounts. Spawning on an
    /// unmounted scope does nothing.
    ///
    /// # Returns
    ///
    /// `true` if the task was spawned.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_mounted() {
            return false;
        }
        let token = self.clone();
        let handle = tokio::spawn(async move {
            token.run(fut).await;
        });

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        true
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn live_tasks(&self) -> usize {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.iter().filter(|h| !h.is_finished()).count()
    }
}

/// Owning handle for a mounted view.
///
/// Dropping the scope unmounts the view.
#[derive(Debug)]
pub struct ViewScope {
    token: ScopeToken,
}

impl ViewScope {
    /// Mount a new view.
    pub fn mount() -> Self {
        let (unmounted_tx, _rx) = watch::channel(false);
        Self {
            token: ScopeToken {
                inner: Arc::new(ScopeInner {
                    unmounted_tx,
                    tasks: Mutex::new(Vec::new()),
                }),
            },
        }
    }

    /// Returns a cloneable token for this scope.
    pub fn token(&self) -> ScopeToken {
        self.token.clone()
    }

    /// Returns `true` until [`unmount`](Self::unmount) runs.
    pub fn is_mounted(&self) -> bool {
        self.token.is_mounted()
    }

    /// Spawn a task owned by the view. See [`ScopeToken::spawn`].
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.token.spawn(fut)
    }

    /// Unmount the view: wake every waiter and abort every owned task.
    ///
    /// Calling `unmount` more than once is safe.
    pub fn unmount(&self) {
        let was_mounted = !self.token.inner.unmounted_tx.send_replace(true);
        let tasks: Vec<_> = {
            let mut tasks = self
                .token
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        if was_mounted {
            tracing::debug!(aborted = tasks.len(), "view unmounted");
        }
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Identity of one fetch started through [`ViewState::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

/// Point-in-time copy of a [`ViewState`].
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot<T> {
    /// A fetch is in flight.
    pub loading: bool,
    /// User-facing error from the last completed fetch.
    pub error: Option<String>,
    /// Last successfully fetched value.
    pub value: Option<T>,
}

impl<T> Default for ViewSnapshot<T> {
    fn default() -> Self {
        Self {
            loading: false,
            error: None,
            value: None,
        }
    }
}

/// Data a view fetched, owned by that view.
///
/// Completions are accepted only while the view is mounted and only for
/// the most recently started fetch; older responses that arrive late are
/// dropped. `Clone` shares the same state.
pub struct ViewState<T> {
    scope: ScopeToken,
    latest: Arc<AtomicU64>,
    tx: Arc<watch::Sender<ViewSnapshot<T>>>,
}

impl<T> Clone for ViewState<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            latest: self.latest.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> ViewState<T> {
    /// Create empty state bound to `scope`.
    pub fn new(scope: &ScopeToken) -> Self {
        let (tx, _rx) = watch::channel(ViewSnapshot::default());
        Self {
            scope: scope.clone(),
            latest: Arc::new(AtomicU64::new(0)),
            tx: Arc::new(tx),
        }
    }

    /// Mark a new fetch as started and supersede any fetch in flight.
    pub fn begin(&self) -> FetchTicket {
        let ticket = FetchTicket(self.latest.fetch_add(1, Ordering::AcqRel) + 1);
        if self.scope.is_mounted() {
            self.tx.send_modify(|s| {
                s.loading = true;
                s.error = None;
            });
        }
        ticket
    }

    /// Record the outcome of the fetch identified by `ticket`.
    ///
    /// A failure keeps the previously fetched value and stores the error's
    /// user-facing message.
    ///
    /// # Returns
    ///
    /// `true` if the outcome was applied; `false` if the view unmounted or
    /// a newer fetch has started since.
    pub fn finish(&self, ticket: FetchTicket, result: Result<T, GatewayError>) -> bool {
        if !self.scope.is_mounted() {
            tracing::debug!("dropping fetch result for unmounted view");
            return false;
        }
        if ticket.0 != self.latest.load(Ordering::Acquire) {
            tracing::debug!(ticket = ticket.0, "dropping superseded fetch result");
            return false;
        }
        self.tx.send_modify(|s| {
            s.loading = false;
            match result {
                Ok(value) => {
                    s.value = Some(value);
                    s.error = None;
                }
                Err(e) => s.error = Some(e.user_message()),
            }
        });
        true
    }

    /// Patch the current value in place (optimistic update after a write).
    ///
    /// # Returns
    ///
    /// `true` if a value was present and the view is still mounted.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        if !self.scope.is_mounted() {
            return false;
        }
        self.tx.send_if_modified(|s| match s.value.as_mut() {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        })
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> ViewSnapshot<T> {
        self.tx.borrow().clone()
    }

    /// Returns a copy of the current value.
    pub fn value(&self) -> Option<T> {
        self.tx.borrow().value.clone()
    }

    /// Returns the current error message.
    pub fn error(&self) -> Option<String> {
        self.tx.borrow().error.clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot<T>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_while_mounted() {
        let scope = ViewScope::mount();
        assert!(scope.token().sleep(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_wakes_sleepers_early() {
        let scope = ViewScope::mount();
        let token = scope.token();
        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        scope.unmount();
        assert!(!sleeper.await.expect("join"), "sleep should report unmount");
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_aborts_spawned_tasks() {
        let scope = ViewScope::mount();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        assert!(scope.spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scope.unmount();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3, "no ticks after unmount");
        assert_eq!(scope.token().live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_scope_unmounts() {
        let scope = ViewScope::mount();
        let token = scope.token();
        drop(scope);
        assert!(!token.is_mounted());
        assert!(!token.spawn(async {}), "spawn after unmount is refused");
        assert_eq!(token.run(async { 1 }).await, None);
    }

    #[tokio::test]
    async fn unmount_twice_is_safe() {
        let scope = ViewScope::mount();
        scope.unmount();
        scope.unmount();
        assert!(!scope.is_mounted());
    }

    #[tokio::test]
    async fn finish_applies_latest_ticket_only() {
        let scope = ViewScope::mount();
        let state: ViewState<u32> = ViewState::new(&scope.token());

        let first = state.begin();
        let second = state.begin();
        assert!(state.snapshot().loading);

        assert!(state.finish(second, Ok(2)));
        assert!(!state.finish(first, Ok(1)), "stale result must be ignored");
        assert_eq!(state.value(), Some(2));
        assert!(!state.snapshot().loading);
    }

    #[tokio::test]
    async fn finish_after_unmount_is_ignored() {
        let scope = ViewScope::mount();
        let state: ViewState<u32> = ViewState::new(&scope.token());
        let ticket = state.begin();

        scope.unmount();
        assert!(!state.finish(ticket, Ok(7)));
        assert_eq!(state.value(), None);
    }

    #[tokio::test]
    async fn failure_keeps_value_and_sets_message() {
        let scope = ViewScope::mount();
        let state: ViewState<u32> = ViewState::new(&scope.token());
        let t = state.begin();
        state.finish(t, Ok(5));

        let t = state.begin();
        assert_eq!(state.error(), None, "begin clears the previous error");
        state.finish(t, Err(GatewayError::Server { status: 503 }));

        let snap = state.snapshot();
        assert_eq!(snap.value, Some(5));
        assert_eq!(snap.error.as_deref(), Some(crate::error::SERVER_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn update_patches_only_present_value() {
        let scope = ViewScope::mount();
        let state: ViewState<Vec<u32>> = ViewState::new(&scope.token());
        assert!(!state.update(|v| v.push(1)), "nothing to patch yet");

        let t = state.begin();
        state.finish(t, Ok(vec![1]));
        assert!(state.update(|v| v.push(2)));
        assert_eq!(state.value(), Some(vec![1, 2]));

        scope.unmount();
        assert!(!state.update(|v| v.push(3)));
        assert_eq!(state.value(), Some(vec![1, 2]));
    }
}

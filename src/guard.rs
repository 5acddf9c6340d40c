//! View router and route guard.
//!
//! [`RouteGuard::decide`] is a pure function of the session phase and the
//! current path. [`RouteGuard::spawn`] runs it reactively: it re-evaluates
//! only when the `(phase, path)` pair changes and applies each redirect
//! with replace semantics, so a redirect never adds a history entry and
//! never triggers another redirect.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{broadcast, watch};

use crate::session::{SessionPhase, SessionStore};

/// Login page.
pub const LOGIN_PATH: &str = "/patient/login";
/// Where authenticated users land.
pub const DASHBOARD_PATH: &str = "/patient/dashboard";
/// Return page after a completed checkout.
pub const PAYMENT_SUCCESS_PATH: &str = "/patient/payment/success";
/// Return page after an abandoned checkout.
pub const PAYMENT_CANCEL_PATH: &str = "/patient/payment/cancel";

/// The portal's routes and which of them need a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    /// Login page; public, and off-limits once signed in.
    pub login: String,
    /// Landing page for authenticated users.
    pub landing: String,
    /// Paths that only ever redirect (`/`, `/patient`).
    pub root_aliases: Vec<String>,
    /// Routes that require a session.
    pub protected: Vec<String>,
    /// Other routes anyone may see.
    pub public: Vec<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            login: LOGIN_PATH.to_owned(),
            landing: DASHBOARD_PATH.to_owned(),
            root_aliases: vec!["/".to_owned(), "/patient".to_owned()],
            protected: vec![
                DASHBOARD_PATH.to_owned(),
                PAYMENT_SUCCESS_PATH.to_owned(),
                PAYMENT_CANCEL_PATH.to_owned(),
            ],
            public: Vec::new(),
        }
    }
}

impl RouteTable {
    fn is_root_alias(&self, path: &str) -> bool {
        self.root_aliases.iter().any(|p| p == path)
    }

    fn is_protected(&self, path: &str) -> bool {
        path == self.landing || self.protected.iter().any(|p| p == path)
    }

    fn is_known(&self, path: &str) -> bool {
        path == self.login || self.is_protected(path) || self.public.iter().any(|p| p == path)
    }

    fn home_for(&self, phase: SessionPhase) -> &str {
        match phase {
            SessionPhase::Authenticated => &self.landing,
            _ => &self.login,
        }
    }
}

/// Outcome of a guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// The session is still loading; do nothing yet.
    Wait,
    /// Render the requested path.
    Allow,
    /// Replace the current path with `to`.
    Redirect {
        /// Target path.
        to: String,
    },
}

/// What the shell should render for a `(phase, path)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteView {
    /// The loading indicator.
    Waiting,
    /// The route at this path.
    Route(String),
    /// Nothing; a redirect is about to replace the path.
    Redirecting,
}

/// A redirect applied by a running guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Path the user was on.
    pub from: String,
    /// Path they were sent to.
    pub to: String,
    /// Session phase that caused it.
    pub phase: SessionPhase,
}

/// Pure routing policy over a [`RouteTable`].
#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    table: RouteTable,
}

impl RouteGuard {
    /// Create a guard over `table`.
    pub fn new(table: RouteTable) -> Self {
        Self { table }
    }

    /// Returns the route table.
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Decide what to do with `path` in `phase`.
    ///
    /// Never redirects while loading. Every redirect target is itself
    /// allowed in the same phase.
    pub fn decide(&self, phase: SessionPhase, path: &str) -> GuardDecision {
        if phase == SessionPhase::Loading {
            return GuardDecision::Wait;
        }
        let path = normalize(path);
        let home = self.table.home_for(phase);
        let redirect = || GuardDecision::Redirect {
            to: home.to_owned(),
        };

        if self.table.is_root_alias(path) || !self.table.is_known(path) {
            return redirect();
        }
        match phase {
            SessionPhase::Authenticated if path == self.table.login => redirect(),
            SessionPhase::Anonymous if self.table.is_protected(path) => redirect(),
            _ => GuardDecision::Allow,
        }
    }

    /// What to render for `path` in `phase`.
    pub fn view(&self, phase: SessionPhase, path: &str) -> RouteView {
        match self.decide(phase, path) {
            GuardDecision::Wait => RouteView::Waiting,
            GuardDecision::Allow => RouteView::Route(normalize(path).to_owned()),
            GuardDecision::Redirect { .. } => RouteView::Redirecting,
        }
    }

    /// Run the guard against `session` and `router` until shut down.
    ///
    /// # Returns
    ///
    /// A [`GuardHandle`] exposing the redirect event stream and shutdown.
    pub fn spawn(self, session: &SessionStore, router: &Router) -> GuardHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let redirects = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(run_guard_loop(
            self,
            session.subscribe(),
            router.clone(),
            events_tx.clone(),
            redirects.clone(),
            shutdown_rx,
        ));

        GuardHandle {
            shutdown_tx,
            events_tx,
            redirects,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Trailing slashes do not name a different route.
fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

async fn run_guard_loop(
    guard: RouteGuard,
    mut session_rx: watch::Receiver<crate::session::Session>,
    router: Router,
    events_tx: broadcast::Sender<Redirect>,
    redirects: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut path_rx = router.subscribe();
    let mut last: Option<(SessionPhase, String)> = None;

    loop {
        let phase = session_rx.borrow_and_update().phase();
        let path = path_rx.borrow_and_update().current().to_owned();

        let pair = (phase, path);
        if last.as_ref() != Some(&pair) {
            let (phase, path) = &pair;
            match guard.decide(*phase, path) {
                GuardDecision::Wait => tracing::debug!(%path, "guard: waiting for session"),
                GuardDecision::Allow => {}
                GuardDecision::Redirect { to } => {
                    tracing::info!(from = %path, to = %to, ?phase, "guard: redirect");
                    router.replace(&to);
                    redirects.fetch_add(1, Ordering::AcqRel);
                    // No subscribers is fine.
                    let _ = events_tx.send(Redirect {
                        from: path.clone(),
                        to,
                        phase: *phase,
                    });
                }
            }
            last = Some(pair);
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return,
            changed = session_rx.changed() => if changed.is_err() { return },
            changed = path_rx.changed() => if changed.is_err() { return },
        }
    }
}

/// Handle for a running route guard.
#[derive(Clone)]
pub struct GuardHandle {
    shutdown_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<Redirect>,
    redirects: Arc<AtomicUsize>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for GuardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardHandle")
            .field("redirects", &self.redirect_count())
            .finish()
    }
}

impl GuardHandle {
    /// Subscribe to redirects applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Redirect> {
        self.events_tx.subscribe()
    }

    /// Total redirects applied since the guard started.
    pub fn redirect_count(&self) -> usize {
        self.redirects.load(Ordering::Acquire)
    }

    /// Stop the guard and wait for it to exit. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the guard task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("route guard task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// Navigation history of a [`Router`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    entries: Vec<String>,
}

impl History {
    /// The current path.
    pub fn current(&self) -> &str {
        self.entries.last().map_or("/", String::as_str)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Owns the current path. `Clone` shares the same history.
#[derive(Debug, Clone)]
pub struct Router {
    tx: Arc<watch::Sender<History>>,
}

impl Router {
    /// Create a router positioned at `initial`.
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(History {
            entries: vec![initial.into()],
        });
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current path.
    pub fn current(&self) -> String {
        self.tx.borrow().current().to_owned()
    }

    /// Returns a copy of the history.
    pub fn history(&self) -> History {
        self.tx.borrow().clone()
    }

    /// Push `path` as a new history entry. Navigating to the current path
    /// does nothing.
    pub fn navigate(&self, path: &str) {
        self.tx.send_if_modified(|h| {
            if h.current() == path {
                return false;
            }
            h.entries.push(path.to_owned());
            true
        });
    }

    /// Replace the current entry with `path`.
    pub fn replace(&self, path: &str) {
        self.tx.send_if_modified(|h| {
            if h.current() == path {
                return false;
            }
            match h.entries.last_mut() {
                Some(last) => *last = path.to_owned(),
                None => h.entries.push(path.to_owned()),
            }
            true
        });
    }

    /// Subscribe to path changes.
    pub fn subscribe(&self) -> watch::Receiver<History> {
        self.tx.subscribe()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new("/")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{Identity, SESSION_KEY};
    use crate::storage::MemoryStorage;

    use crate::session::SessionPhase::{Anonymous, Authenticated, Loading};

    fn redirect(to: &str) -> GuardDecision {
        GuardDecision::Redirect { to: to.to_owned() }
    }

    #[test]
    fn loading_never_redirects() {
        let guard = RouteGuard::default();
        for path in ["/", "/patient", LOGIN_PATH, DASHBOARD_PATH, "/nope"] {
            assert_eq!(guard.decide(Loading, path), GuardDecision::Wait, "{path}");
            assert_eq!(guard.view(Loading, path), RouteView::Waiting);
        }
    }

    #[test]
    fn root_aliases_follow_phase() {
        let guard = RouteGuard::default();
        for path in ["/", "/patient", "/patient/"] {
            assert_eq!(guard.decide(Authenticated, path), redirect(DASHBOARD_PATH));
            assert_eq!(guard.decide(Anonymous, path), redirect(LOGIN_PATH));
        }
    }

    #[test]
    fn login_page_bounces_signed_in_users() {
        let guard = RouteGuard::default();
        assert_eq!(guard.decide(Authenticated, LOGIN_PATH), redirect(DASHBOARD_PATH));
        assert_eq!(guard.decide(Anonymous, LOGIN_PATH), GuardDecision::Allow);
    }

    #[test]
    fn protected_routes_require_a_session() {
        let guard = RouteGuard::default();
        for path in [DASHBOARD_PATH, PAYMENT_SUCCESS_PATH, PAYMENT_CANCEL_PATH] {
            assert_eq!(guard.decide(Anonymous, path), redirect(LOGIN_PATH));
            assert_eq!(guard.decide(Authenticated, path), GuardDecision::Allow);
            assert_eq!(
                guard.view(Authenticated, path),
                RouteView::Route(path.to_owned())
            );
        }
    }

    #[test]
    fn unknown_paths_go_home() {
        let guard = RouteGuard::default();
        assert_eq!(guard.decide(Authenticated, "/admin"), redirect(DASHBOARD_PATH));
        assert_eq!(guard.decide(Anonymous, "/admin"), redirect(LOGIN_PATH));
        assert_eq!(guard.view(Anonymous, "/admin"), RouteView::Redirecting);
    }

    #[test]
    fn public_routes_are_open_to_everyone() {
        let mut table = RouteTable::default();
        table.public.push("/patient/help".to_owned());
        let guard = RouteGuard::new(table);
        assert_eq!(guard.decide(Anonymous, "/patient/help"), GuardDecision::Allow);
        assert_eq!(guard.decide(Authenticated, "/patient/help"), GuardDecision::Allow);
    }

    #[test]
    fn redirect_targets_are_always_allowed() {
        let guard = RouteGuard::default();
        let paths = ["/", "/patient", LOGIN_PATH, DASHBOARD_PATH, PAYMENT_CANCEL_PATH, "/x/y"];
        for phase in [Anonymous, Authenticated] {
            for path in paths {
                if let GuardDecision::Redirect { to } = guard.decide(phase, path) {
                    assert_eq!(guard.decide(phase, &to), GuardDecision::Allow, "{phase:?} {path}");
                }
            }
        }
    }

    #[test]
    fn router_navigate_pushes_and_replace_swaps() {
        let router = Router::new("/");
        router.navigate(LOGIN_PATH);
        router.navigate(LOGIN_PATH);
        router.replace(DASHBOARD_PATH);
        assert_eq!(router.current(), DASHBOARD_PATH);
        assert_eq!(
            router.history().entries(),
            &["/".to_owned(), DASHBOARD_PATH.to_owned()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_guard_waits_for_restore_then_redirects_once() {
        let storage = Arc::new(MemoryStorage::with_entry(
            SESSION_KEY,
            r#"{"subjectId":"p1","displayName":"Jane Doe","authToken":"t1"}"#,
        ));
        let session = SessionStore::new(storage);
        let router = Router::new(LOGIN_PATH);
        let handle = RouteGuard::default().spawn(&session, &router);
        let mut events = handle.subscribe();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.redirect_count(), 0, "no redirect while loading");
        assert_eq!(router.current(), LOGIN_PATH);

        session.restore();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.redirect_count(), 1);
        assert_eq!(router.current(), DASHBOARD_PATH);
        assert_eq!(router.history().entries().len(), 1, "redirect replaces");

        let event = events.recv().await.expect("redirect event");
        assert_eq!(event.from, LOGIN_PATH);
        assert_eq!(event.to, DASHBOARD_PATH);
        assert_eq!(event.phase, Authenticated);

        handle.shutdown().await.expect("shutdown");
        handle.shutdown().await.expect("second shutdown");
    }

    #[tokio::test]
    async fn empty_storage_redirects_only_after_restore() {
        let session = SessionStore::new(Arc::new(MemoryStorage::new()));
        let router = Router::new(DASHBOARD_PATH);
        let handle = RouteGuard::new(RouteTable::default()).spawn(&session, &router);

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.redirect_count(), 0, "loading holds the protected page");
        assert_eq!(router.current(), DASHBOARD_PATH);

        session.restore();
        tokio::task::yield_now().await;
        assert_eq!(handle.redirect_count(), 1);
        assert_eq!(router.current(), LOGIN_PATH);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn logout_sends_user_to_login_and_navigation_is_guarded() {
        let session = SessionStore::new(Arc::new(MemoryStorage::new()));
        session.restore();
        session
            .login(Identity::new("p1", "Jane Doe", "t1"))
            .expect("login");
        let router = Router::new(DASHBOARD_PATH);
        let handle = RouteGuard::default().spawn(&session, &router);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.redirect_count(), 0);

        session.logout().expect("logout");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(router.current(), LOGIN_PATH);

        router.navigate(PAYMENT_SUCCESS_PATH);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(router.current(), LOGIN_PATH);
        assert_eq!(handle.redirect_count(), 2);

        // Unrelated session updates with the same phase do not re-trigger.
        session.logout().expect("second logout");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.redirect_count(), 2);

        handle.shutdown().await.expect("shutdown");
    }
}

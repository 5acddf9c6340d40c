//! Session store: the single source of truth for who is signed in.
//!
//! [`SessionStore`] owns the in-memory [`Session`], persists the
//! [`Identity`] part of it through a [`SessionStorage`] backend, and
//! publishes every change on a `tokio::sync::watch` channel. Each change is
//! one value swap, so a subscriber can never observe a session with the
//! name set but the token missing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::SessionError;
use crate::storage::SessionStorage;

/// Well-known storage key for the persisted session blob.
pub const SESSION_KEY: &str = "currentPatient";

/// The persisted part of a session.
///
/// Serialized as `{ subjectId, displayName, emailAddress, authToken }`.
/// Deserialization also accepts the login response spelling
/// (`patientId`, `name`, `email`, `token`) so a login response body can be
/// turned into an identity directly. Unknown fields are ignored.
///
/// `Debug` output never contains the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable id of the signed-in subject (the patient id).
    #[serde(alias = "patientId")]
    pub subject_id: String,
    /// Name shown in the navigation bar.
    #[serde(alias = "name")]
    pub display_name: String,
    /// Contact email, when the backend supplied one.
    #[serde(default, alias = "email")]
    pub email_address: Option<String>,
    /// Opaque bearer token. Without it the identity is anonymous.
    #[serde(default, alias = "token")]
    pub auth_token: Option<String>,
}

impl Identity {
    /// Build an identity with a token and no email address.
    pub fn new(
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            email_address: None,
            auth_token: Some(auth_token.into()),
        }
    }

    /// Set the email address.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email_address = Some(email.into());
        self
    }

    /// Returns the auth token if it is present and non-blank.
    pub fn token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    /// Returns `true` if the identity can authenticate requests.
    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.subject_id.trim().is_empty() {
            return Err(SessionError::MissingSubject);
        }
        if !self.has_token() {
            return Err(SessionError::MissingToken);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("subject_id", &self.subject_id)
            .field("display_name", &self.display_name)
            .field("email_address", &self.email_address)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Coarse session state used by the route guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// `restore()` has not completed yet.
    Loading,
    /// No usable identity.
    Anonymous,
    /// An identity with a token is present.
    Authenticated,
}

/// The client's record of the current identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    identity: Option<Identity>,
    loading: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("phase", &self.phase())
            .field("identity", &self.identity)
            .finish()
    }
}

impl Session {
    /// The state before [`SessionStore::restore`] has run.
    fn initial() -> Self {
        Self {
            identity: None,
            loading: true,
        }
    }

    fn resolved(identity: Option<Identity>) -> Self {
        Self {
            identity,
            loading: false,
        }
    }

    /// Returns the phase derived from the loading flag and token presence.
    pub fn phase(&self) -> SessionPhase {
        if self.loading {
            SessionPhase::Loading
        } else if self.identity.as_ref().is_some_and(Identity::has_token) {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Anonymous
        }
    }

    /// Returns `true` until the first restore completes.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Returns `true` if the session can authenticate requests.
    pub fn is_authenticated(&self) -> bool {
        self.phase() == SessionPhase::Authenticated
    }

    /// Returns the identity when the session is authenticated.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref().filter(|i| i.has_token())
    }

    /// Returns the bearer token when the session is authenticated.
    pub fn token(&self) -> Option<&str> {
        self.identity().and_then(Identity::token)
    }
}

struct Inner {
    storage: Arc<dyn SessionStorage>,
    key: String,
    tx: watch::Sender<Session>,
}

/// Observable, persisted session.
///
/// `Clone` is cheap: all clones share one session and one storage backend.
/// Pass clones to every consumer instead of reaching for a global.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("key", &self.inner.key)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SessionStore {
    /// Create a store over `storage` using [`SESSION_KEY`].
    ///
    /// The session starts in [`SessionPhase::Loading`] until
    /// [`restore`](Self::restore) runs.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self::with_key(storage, SESSION_KEY)
    }

    /// Create a store over `storage` using a custom key.
    pub fn with_key(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(Session::initial());
        Self {
            inner: Arc::new(Inner {
                storage,
                key: key.into(),
                tx,
            }),
        }
    }

    /// Load the persisted session, clearing the loading flag.
    ///
    /// Absent blob: anonymous. Valid blob with a token: authenticated.
    /// Malformed or token-less blob: the entry is deleted and the session
    /// stays anonymous. Storage read failures are logged and treated as an
    /// absent blob. This never fails and always clears the loading flag.
    ///
    /// # Returns
    ///
    /// The session as published to subscribers.
    pub fn restore(&self) -> Session {
        let key = self.inner.key.as_str();
        let raw = match self.inner.storage.read(key) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "session read failed; starting anonymous");
                None
            }
        };

        let identity = raw.and_then(|raw| match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) if identity.validate().is_ok() => Some(identity),
            Ok(_) => {
                tracing::warn!(key, "persisted session is incomplete; discarding");
                self.discard_persisted();
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "persisted session is malformed; discarding");
                self.discard_persisted();
                None
            }
        });

        let session = Session::resolved(identity);
        tracing::debug!(phase = ?session.phase(), "session restored");
        self.inner.tx.send_replace(session.clone());
        session
    }

    /// Replace the session with `identity` and persist it.
    ///
    /// The blob is written first; the in-memory session changes only after
    /// the write succeeded, in a single swap.
    ///
    /// # Errors
    ///
    /// * [`SessionError::MissingToken`] / [`SessionError::MissingSubject`]
    ///   -- the identity could never authenticate; nothing changes.
    /// * [`SessionError::Encode`] / [`SessionError::Storage`] -- the blob
    ///   could not be persisted; the previous session is kept.
    pub fn login(&self, identity: Identity) -> Result<Session, SessionError> {
        identity.validate()?;

        let blob = serde_json::to_string(&identity)?;
        self.inner.storage.write(&self.inner.key, &blob)?;

        tracing::info!(subject_id = %identity.subject_id, "session established");
        let session = Session::resolved(Some(identity));
        self.inner.tx.send_replace(session.clone());
        Ok(session)
    }

    /// Clear the session and delete the persisted entry.
    ///
    /// The in-memory session is cleared first and unconditionally, so a
    /// storage failure never leaves the user signed in.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the persisted entry could not be
    /// removed.
    pub fn logout(&self) -> Result<(), SessionError> {
        self.inner.tx.send_replace(Session::resolved(None));
        tracing::info!("session cleared");
        self.inner.storage.remove(&self.inner.key)?;
        Ok(())
    }

    /// Returns a clone of the current session.
    pub fn snapshot(&self) -> Session {
        self.inner.tx.borrow().clone()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.tx.borrow().phase()
    }

    /// Returns the current bearer token, if authenticated.
    pub fn token(&self) -> Option<String> {
        self.inner.tx.borrow().token().map(str::to_owned)
    }

    /// Subscribe to session changes.
    ///
    /// The receiver sees the current value immediately and is marked
    /// changed on every restore, login and logout.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.tx.subscribe()
    }

    fn discard_persisted(&self) {
        if let Err(e) = self.inner.storage.remove(&self.inner.key) {
            tracing::warn!(key = %self.inner.key, error = %e, "failed to discard persisted session");
        }
    }
}

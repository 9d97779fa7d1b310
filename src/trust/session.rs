//! Trust sessions and their in-memory store.
//!
//! Entries expire lazily: the first read that observes `now > expiry`
//! removes the entry and reports the session as missing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Opaque key under which a session is stored.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| SessionError::AuthenticationRequired)
    }
}

/// Temporary credentials for a verified cross-account role.
#[derive(Clone, Eq, PartialEq)]
pub struct TrustSession {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
    /// Account that owns the role.
    pub account_id: String,
    /// Assumed role.
    pub role_arn: String,
    /// Region the session operates in.
    pub region: String,
}

impl TrustSession {
    /// Returns `true` once `now` is past the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl fmt::Debug for TrustSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustSession")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .field("role_arn", &self.role_arn)
            .field("region", &self.region)
            .finish()
    }
}

/// Errors raised when reading a session.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The session is unknown or has expired.
    #[error("authentication required: verify the account trust relationship again")]
    AuthenticationRequired,
}

/// Keyed session storage.
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces the session stored under `id`.
    fn put(&self, id: SessionId, session: TrustSession);

    /// Returns the live session stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthenticationRequired`] when no session is
    /// stored or the stored one has expired.
    fn get(&self, id: &SessionId) -> Result<TrustSession, SessionError>;

    /// Removes the session stored under `id`, if any.
    fn remove(&self, id: &SessionId);
}

/// Process-local [`SessionStore`] with lazy expiry.
pub struct InMemorySessionStore<C = SystemClock> {
    sessions: Mutex<HashMap<SessionId, TrustSession>>,
    clock: C,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl InMemorySessionStore {
    /// Creates an empty store using the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> InMemorySessionStore<C> {
    /// Creates an empty store reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> fmt::Debug for InMemorySessionStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InMemorySessionStore")
            .field("sessions", &count)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> SessionStore for InMemorySessionStore<C> {
    fn put(&self, id: SessionId, session: TrustSession) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, session);
    }

    fn get(&self, id: &SessionId) -> Result<TrustSession, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(id) {
            Some(session) if !session.is_expired(now) => Ok(session.clone()),
            Some(_) => {
                sessions.remove(id);
                tracing::debug!(session_id = %id, "trust session expired");
                Err(SessionError::AuthenticationRequired)
            }
            None => Err(SessionError::AuthenticationRequired),
        }
    }

    fn remove(&self, id: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[fixture]
    fn session() -> TrustSession {
        TrustSession {
            access_key_id: String::from("ASIAEXAMPLE"),
            secret_access_key: String::from("super-secret"),
            session_token: String::from("token-value"),
            expires_at: start() + TimeDelta::hours(1),
            account_id: String::from("210987654321"),
            role_arn: String::from("arn:aws:iam::210987654321:role/SkiffDeployerRole"),
            region: String::from("us-east-1"),
        }
    }

    #[rstest]
    fn live_sessions_are_returned(session: TrustSession) {
        let clock = ManualClock::new(start());
        let store = InMemorySessionStore::with_clock(clock.clone());
        let id = SessionId::generate();
        store.put(id, session.clone());

        clock.advance(TimeDelta::minutes(59));
        assert_eq!(store.get(&id), Ok(session));
    }

    #[rstest]
    fn expired_sessions_are_removed_on_read(session: TrustSession) {
        let clock = ManualClock::new(start());
        let store = InMemorySessionStore::with_clock(clock.clone());
        let id = SessionId::generate();
        store.put(id, session);

        clock.advance(TimeDelta::minutes(61));
        assert_eq!(store.get(&id), Err(SessionError::AuthenticationRequired));
        assert!(store.is_empty());
    }

    #[rstest]
    fn missing_and_expired_look_the_same(session: TrustSession) {
        let clock = ManualClock::new(start() + TimeDelta::hours(2));
        let store = InMemorySessionStore::with_clock(clock);
        let expired = SessionId::generate();
        store.put(expired, session);

        assert_eq!(
            store.get(&expired),
            store.get(&SessionId::generate())
        );
    }

    #[rstest]
    fn put_replaces_existing_entry(session: TrustSession) {
        let store = InMemorySessionStore::with_clock(ManualClock::new(start()));
        let id = SessionId::generate();
        store.put(id, session.clone());
        let replacement = TrustSession {
            region: String::from("eu-west-1"),
            ..session
        };
        store.put(id, replacement.clone());

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id), Ok(replacement));
    }

    #[rstest]
    fn debug_output_redacts_secrets(session: TrustSession) {
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("token-value"));
        assert!(rendered.contains("ASIAEXAMPLE"));
    }

    #[test]
    fn session_ids_round_trip_through_text() {
        let id = SessionId::generate();
        assert_eq!(id.to_string().parse::<SessionId>(), Ok(id));
        assert_eq!(
            "not-a-session".parse::<SessionId>(),
            Err(SessionError::AuthenticationRequired)
        );
    }
}

use crate::error::{Error, Result};
use crate::models::Role;
use argon2::password_hash::{rand_core::OsRng as SaltRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Immutable snapshot captured at authentication time. A role change
/// elsewhere does not affect an already-issued session until the user
/// re-authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: i64,
    pub organization_id: i64,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

/// Pluggable backing for the active-session set, so the manager's logic
/// is testable independent of the storage technology.
pub trait SessionStore: Send + Sync {
    fn insert(&self, token: String, session: Session);
    fn get(&self, token: &str) -> Option<Session>;
    fn remove(&self, token: &str);
}

/// Process-local session set. Concurrent access on distinct tokens does
/// not interfere; a purge racing a reader of the same token is benign
/// (last purge wins).
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, token: String, session: Session) {
        self.sessions.lock().unwrap().insert(token, session);
    }

    fn get(&self, token: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(token).cloned()
    }

    fn remove(&self, token: &str) {
        self.sessions.lock().unwrap().remove(token);
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_ttl(store, Duration::hours(24))
    }

    pub fn with_ttl(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Issue a session token for an authenticated user. 256 bits from
    /// the OS random source, hex-encoded; collisions are treated as
    /// negligible and not checked.
    pub fn create(&self, user_id: i64, organization_id: i64, role: Role) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.store.insert(
            token.clone(),
            Session {
                user_id,
                organization_id,
                role,
                expires_at: Utc::now() + self.ttl,
            },
        );
        token
    }

    /// Look up a token. Expired sessions are purged lazily here.
    pub fn validate(&self, token: &str) -> Result<Session> {
        let session = self.store.get(token).ok_or(Error::NotFound("session"))?;
        if Utc::now() >= session.expires_at {
            self.store.remove(token);
            return Err(Error::ExpiredSession);
        }
        Ok(session)
    }

    /// Idempotent: removing an absent token is not an error.
    pub fn destroy(&self, token: &str) {
        self.store.remove(token);
    }
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SessionManager, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::default());
        (SessionManager::new(store.clone()), store)
    }

    #[test]
    fn create_then_validate_returns_the_snapshot() {
        let (manager, _) = manager();
        let token = manager.create(7, 1, Role::Agent);

        let session = manager.validate(&token).unwrap();
        assert_eq!(session.user_id, 7);
        assert_eq!(session.organization_id, 1);
        assert_eq!(session.role, Role::Agent);
    }

    #[test]
    fn unknown_token_is_not_found() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.validate("deadbeef"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn destroy_is_idempotent() {
        let (manager, _) = manager();
        let token = manager.create(7, 1, Role::Admin);

        manager.destroy(&token);
        manager.destroy(&token);
        assert!(matches!(
            manager.validate(&token),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn expiry_boundary() {
        let (manager, store) = manager();

        // Valid one second before expiry.
        store.insert(
            "early".into(),
            Session {
                user_id: 1,
                organization_id: 1,
                role: Role::Customer,
                expires_at: Utc::now() + Duration::seconds(1),
            },
        );
        assert!(manager.validate("early").is_ok());

        // Invalid one second after, and purged on the failed lookup.
        store.insert(
            "late".into(),
            Session {
                user_id: 1,
                organization_id: 1,
                role: Role::Customer,
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );
        assert!(matches!(manager.validate("late"), Err(Error::ExpiredSession)));
        assert!(store.get("late").is_none());
        assert!(matches!(
            manager.validate("late"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let (manager, _) = manager();
        let a = manager.create(1, 1, Role::Customer);
        let b = manager.create(1, 1, Role::Customer);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("s3cret").unwrap();
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("s3cret", "not-a-hash"));
    }
}

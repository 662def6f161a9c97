//! Session Keeper: in-process session tokens with TTL and constant-time
//! comparison, used for the optional application password.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

pub struct SessionKeeper {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
}

impl SessionKeeper {
    pub fn new(timeout: Duration) -> Self {
        SessionKeeper {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn create(&self, user_id: impl Into<String>) -> Session {
        let now = Utc::now();
        let session = Session {
            id: random_session_id(),
            user_id: user_id.into(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.timeout).unwrap_or_default(),
        };
        self.sessions
            .lock()
            .expect("session map mutex poisoned")
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Looks up `id` using a constant-time comparison against stored
    /// session ids. Removes the session if it has expired.
    pub fn validate(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        let matched_key = sessions
            .keys()
            .find(|stored| constant_time_eq(stored, id))
            .cloned();

        let Some(key) = matched_key else {
            return Err(Error::NotFound("session".into()));
        };

        let session = sessions.get(&key).cloned().expect("just matched");
        if session.is_expired(Utc::now()) {
            sessions.remove(&key);
            return Err(Error::Validation {
                field: "session".into(),
                message: "session expired".into(),
            });
        }
        Ok(session)
    }

    pub fn refresh(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound("session".into()))?;
        session.expires_at = Utc::now() + chrono::Duration::from_std(self.timeout).unwrap_or_default();
        Ok(session.clone())
    }

    pub fn destroy(&self, id: &str) {
        self.sessions.lock().expect("session map mutex poisoned").remove(id);
    }

    /// Removes every expired session; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_pairwise_distinct() {
        let keeper = SessionKeeper::new(Duration::from_secs(60));
        let a = keeper.create("alice");
        let b = keeper.create("alice");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn expired_session_fails_validation_and_is_removed() {
        let keeper = SessionKeeper::new(Duration::from_millis(1));
        let session = keeper.create("alice");
        std::thread::sleep(Duration::from_millis(20));
        assert!(keeper.validate(&session.id).is_err());
        assert!(keeper.validate(&session.id).is_err());
    }

    #[test]
    fn valid_session_round_trips() {
        let keeper = SessionKeeper::new(Duration::from_secs(60));
        let session = keeper.create("alice");
        let fetched = keeper.validate(&session.id).unwrap();
        assert_eq!(fetched.user_id, "alice");
    }
}

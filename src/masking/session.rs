//! Masking sessions and their lifecycle
//!
//! A session owns the bidirectional original↔masked map for one
//! conversation turn. Sessions are created lazily on first use, reaped after
//! an inactivity TTL, and never persisted.

use crate::error::{RelayError, Result};
use crate::masking::rules::MaskKind;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How many salt re-derivations to attempt before reporting a collision
const MAX_COLLISION_RETRIES: u32 = 8;

struct SessionState {
    /// original → masked
    forward: AHashMap<String, String>,
    /// masked → original
    reverse: AHashMap<String, String>,
    /// masked → rule that produced it
    attribution: AHashMap<String, MaskKind>,
    last_used_at: Instant,
}

/// Session-scoped bidirectional mapping between originals and pseudonyms
pub struct MaskingSession {
    id: String,
    /// Per-session random key driving the deterministic transforms
    key: [u8; 32],
    created_at: DateTime<Utc>,
    /// One lock serializes the incremental-chunk restorer against the
    /// final-pass restorer; both read the same growing map.
    state: Mutex<SessionState>,
}

impl MaskingSession {
    fn new(id: String) -> Self {
        Self {
            id,
            key: rand::random(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                forward: AHashMap::new(),
                reverse: AHashMap::new(),
                attribution: AHashMap::new(),
                last_used_at: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record a mapping produced by `derive`, which receives the salt to use.
    ///
    /// Re-masking a known original returns the stored pseudonym without
    /// calling `derive`. A derived value colliding with a different
    /// original's pseudonym is re-derived under an incremented salt; two
    /// distinct originals never share a masked value.
    pub fn add_mapping<F>(&self, original: &str, kind: MaskKind, derive: F) -> Result<String>
    where
        F: Fn(u32) -> String,
    {
        let mut state = self.state.lock().expect("masking session poisoned");
        state.last_used_at = Instant::now();

        if let Some(masked) = state.forward.get(original) {
            return Ok(masked.clone());
        }

        for salt in 0..MAX_COLLISION_RETRIES {
            let masked = derive(salt);

            // A transform may degenerate to the original (e.g. a
            // single-character name); nothing to record then.
            if masked == original {
                return Ok(masked);
            }

            match state.reverse.get(&masked) {
                Some(owner) if owner != original => {
                    debug!(
                        "Masked value collision in session '{}' (rule {}), re-deriving with salt {}",
                        self.id,
                        kind.name(),
                        salt + 1
                    );
                    continue;
                }
                _ => {
                    state.forward.insert(original.to_string(), masked.clone());
                    state.reverse.insert(masked.clone(), original.to_string());
                    state.attribution.insert(masked.clone(), kind);
                    return Ok(masked);
                }
            }
        }

        Err(RelayError::masking(format!(
            "Could not derive a collision-free pseudonym in session '{}' after {} attempts",
            self.id, MAX_COLLISION_RETRIES
        )))
    }

    /// The pseudonym for an original, when one was recorded
    pub fn get_masked(&self, original: &str) -> Option<String> {
        let mut state = self.state.lock().expect("masking session poisoned");
        state.last_used_at = Instant::now();
        state.forward.get(original).cloned()
    }

    /// The original behind a pseudonym, when one was recorded
    pub fn get_original(&self, masked: &str) -> Option<String> {
        let mut state = self.state.lock().expect("masking session poisoned");
        state.last_used_at = Instant::now();
        state.reverse.get(masked).cloned()
    }

    /// Whether `value` is a pseudonym recorded in this session
    pub fn is_masked(&self, value: &str) -> bool {
        let state = self.state.lock().expect("masking session poisoned");
        state.reverse.contains_key(value)
    }

    /// The rule that produced a pseudonym
    pub fn attribution(&self, masked: &str) -> Option<MaskKind> {
        let state = self.state.lock().expect("masking session poisoned");
        state.attribution.get(masked).copied()
    }

    /// Restore every known pseudonym in `text`, longest pseudonyms first so
    /// a short match never clobbers part of a longer one. Exact literal
    /// substitution; unknown substrings are left untouched.
    pub fn restore_text(&self, text: &str) -> String {
        let mut state = self.state.lock().expect("masking session poisoned");
        state.last_used_at = Instant::now();

        let mut pairs: Vec<(&String, &String)> = state.reverse.iter().collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut restored = text.to_string();
        for (masked, original) in pairs {
            if restored.contains(masked.as_str()) {
                restored = restored.replace(masked.as_str(), original);
            }
        }
        restored
    }

    /// Number of recorded mappings
    pub fn mapping_count(&self) -> usize {
        self.state.lock().expect("masking session poisoned").forward.len()
    }

    fn idle_for(&self) -> Duration {
        self.state
            .lock()
            .expect("masking session poisoned")
            .last_used_at
            .elapsed()
    }
}

/// Owns every live masking session; reaps them after the inactivity TTL
pub struct SessionManager {
    sessions: DashMap<String, Arc<MaskingSession>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Fetch a session, creating it lazily on first reference
    pub fn get_or_create(&self, session_id: &str) -> Arc<MaskingSession> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("Creating masking session '{}'", session_id);
                Arc::new(MaskingSession::new(session_id.to_string()))
            })
            .clone()
    }

    /// Fetch a session without creating it
    pub fn get(&self, session_id: &str) -> Option<Arc<MaskingSession>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Drop sessions idle past the TTL; returns how many were reaped
    pub fn reap_expired(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions.retain(|_, session| session.idle_for() < ttl);
        let reaped = before - self.sessions.len();
        if reaped > 0 {
            info!("Reaped {} expired masking sessions", reaped);
        }
        reaped
    }

    /// Spawn the periodic reaper task
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.ttl.min(Duration::from_secs(60)).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.reap_expired();
            }
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_mapping_is_idempotent() {
        let session = MaskingSession::new("turn-1".to_string());
        let first = session
            .add_mapping("192.168.1.100", MaskKind::IpAddress, |_| "10.0.ab12.100".to_string())
            .unwrap();
        // The derive closure is not consulted again for a known original.
        let second = session
            .add_mapping("192.168.1.100", MaskKind::IpAddress, |_| "different".to_string())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(session.mapping_count(), 1);
    }

    #[test]
    fn test_collision_triggers_rederivation() {
        let session = MaskingSession::new("turn-1".to_string());
        session
            .add_mapping("10.0.0.1", MaskKind::IpAddress, |_| "collide".to_string())
            .unwrap();

        let masked = session
            .add_mapping("10.0.0.2", MaskKind::IpAddress, |salt| {
                if salt == 0 {
                    "collide".to_string()
                } else {
                    format!("collide-{}", salt)
                }
            })
            .unwrap();

        assert_eq!(masked, "collide-1");
        assert_eq!(session.get_original("collide").as_deref(), Some("10.0.0.1"));
        assert_eq!(session.get_original("collide-1").as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_unresolvable_collision_is_masking_error() {
        let session = MaskingSession::new("turn-1".to_string());
        session
            .add_mapping("a", MaskKind::Hostname, |_| "same".to_string())
            .unwrap();
        let err = session
            .add_mapping("b", MaskKind::Hostname, |_| "same".to_string())
            .unwrap_err();
        assert_eq!(err.category(), "masking");
    }

    #[test]
    fn test_restore_longest_first() {
        let session = MaskingSession::new("turn-1".to_string());
        session
            .add_mapping("10.1.1.1", MaskKind::IpAddress, |_| "host-ab".to_string())
            .unwrap();
        session
            .add_mapping("10.2.2.2", MaskKind::IpAddress, |_| "host-abcd".to_string())
            .unwrap();

        // The longer pseudonym must be restored first or "host-ab" would
        // clobber its prefix.
        let restored = session.restore_text("seen host-abcd and host-ab");
        assert_eq!(restored, "seen 10.2.2.2 and 10.1.1.1");
    }

    #[test]
    fn test_restore_leaves_unknown_text_untouched() {
        let session = MaskingSession::new("turn-1".to_string());
        assert_eq!(session.restore_text("nothing to do"), "nothing to do");
    }

    #[tokio::test]
    async fn test_sessions_created_lazily_and_reaped() {
        let manager = SessionManager::new(Duration::from_millis(20));
        assert_eq!(manager.session_count(), 0);

        let session = manager.get_or_create("turn-1");
        session
            .add_mapping("x", MaskKind::Hostname, |_| "host-x1".to_string())
            .unwrap();
        assert_eq!(manager.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.reap_expired(), 1);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_distinct_sessions_have_distinct_keys() {
        let a = MaskingSession::new("a".to_string());
        let b = MaskingSession::new("b".to_string());
        assert_ne!(a.key(), b.key());
    }
}

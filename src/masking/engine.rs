//! The masking engine: structure walking, rule application, restoration
//!
//! Fail-open by design: on any internal masking error the original
//! (possibly unmasked) data is returned and the event is logged at error
//! level, trading a window of plaintext exposure for pipeline availability.
//! `MaskingConfig::fail_closed` switches to surfacing the error instead.

use crate::config::MaskingConfig;
use crate::error::Result;
use crate::masking::rules;
use crate::masking::session::{MaskingSession, SessionManager};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Rule-driven, session-scoped, bidirectional pseudonymization of nested
/// data and free text
pub struct MaskingEngine {
    sessions: Arc<SessionManager>,
    fail_closed: bool,
}

impl MaskingEngine {
    pub fn new(config: &MaskingConfig) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(Duration::from_secs(config.session_ttl_secs))),
            fail_closed: config.fail_closed,
        }
    }

    /// The session table, for reaper wiring and direct session access
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Mask every string leaf in `values`, recording each substitution in
    /// the session's bidirectional map.
    ///
    /// Fail-open: unless configured fail-closed, a value that cannot be
    /// masked is returned unmodified and the failure is logged.
    pub fn mask_all(&self, values: &[Value], session_id: &str) -> Result<Vec<Value>> {
        let session = self.sessions.get_or_create(session_id);

        let mut masked = Vec::with_capacity(values.len());
        for value in values {
            match self.mask_value(&session, value) {
                Ok(v) => masked.push(v),
                Err(e) => {
                    if self.fail_closed {
                        return Err(e);
                    }
                    error!(
                        "Masking failed in session '{}' (fail-open, returning original): {}",
                        session_id, e
                    );
                    masked.push(value.clone());
                }
            }
        }
        Ok(masked)
    }

    /// Mask a single piece of free text
    pub fn mask_text(&self, text: &str, session_id: &str) -> Result<String> {
        let session = self.sessions.get_or_create(session_id);
        match self.mask_string(&session, text) {
            Ok(masked) => Ok(masked),
            Err(e) => {
                if self.fail_closed {
                    return Err(e);
                }
                error!(
                    "Masking failed in session '{}' (fail-open, returning original): {}",
                    session_id, e
                );
                Ok(text.to_string())
            }
        }
    }

    fn mask_value(&self, session: &MaskingSession, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(text) => Value::String(self.mask_string(session, text)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.mask_value(session, item))
                    .collect::<Result<Vec<Value>>>()?,
            ),
            Value::Object(map) => {
                let mut masked = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    masked.insert(key.clone(), self.mask_value(session, item)?);
                }
                Value::Object(masked)
            }
            other => other.clone(),
        })
    }

    fn mask_string(&self, session: &MaskingSession, text: &str) -> Result<String> {
        // Never re-mask a value that is itself a recorded pseudonym.
        if session.is_masked(text) {
            return Ok(text.to_string());
        }

        let detections = rules::detect(text);
        if detections.is_empty() {
            return Ok(text.to_string());
        }

        let mut result = String::with_capacity(text.len());
        let mut cursor = 0;

        for detection in detections {
            result.push_str(&text[cursor..detection.start]);
            let token = &text[detection.start..detection.end];

            if session.is_masked(token) {
                // Substring already recorded as masked in this session.
                result.push_str(token);
            } else {
                let masked = session.add_mapping(token, detection.kind, |salt| {
                    rules::transform(detection.kind, token, session.key(), salt)
                })?;
                result.push_str(&masked);
            }

            cursor = detection.end;
        }
        result.push_str(&text[cursor..]);

        Ok(result)
    }

    /// Replace every pseudonym known to the session with its original,
    /// longest pseudonyms first. Unknown substrings are left untouched; a
    /// session that was never used restores nothing.
    pub fn restore_text(&self, text: &str, session_id: &str) -> String {
        match self.sessions.get(session_id) {
            Some(session) => session.restore_text(text),
            None => text.to_string(),
        }
    }

    /// Whether `value` is a pseudonym recorded in the session
    pub fn is_masked(&self, value: &str, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|session| session.is_masked(value))
            .unwrap_or(false)
    }
}

//! Rule-driven, session-scoped, bidirectional pseudonymization

mod engine;
mod rules;
mod session;

pub use engine::MaskingEngine;
pub use rules::MaskKind;
pub use session::{MaskingSession, SessionManager};

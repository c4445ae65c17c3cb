//! Scan fan-in / error policy (§4.13): the single cross-driver discipline
//! for deciding `reader_error` vs. normal removal vs. silence. Every driver
//! in this crate routes its presence transitions through `PresenceTracker`
//! instead of re-deriving this rule locally, which is exactly the kind of
//! inconsistency §9's "Open questions" calls out as a bug in some PC/SC
//! implementations.

use crate::token::{Scan, Token};

/// Tracks whether a driver currently has an "active token" (§ glossary:
/// "a token previously emitted by a driver that has not yet been followed
/// by a normal-removal or reader-error scan").
#[derive(Debug, Default)]
pub struct PresenceTracker {
    active: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self { active: false }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// A token was detected or changed. Always emits.
    pub fn on_detected(&mut self, source: impl Into<String>, token: Token) -> Scan {
        self.active = true;
        Scan::detected(source, token)
    }

    /// The driver observed a normal transition to "nothing present".
    /// Emits a removal scan only if a token was actually active; otherwise
    /// there is nothing to report (§8 "Normal removal discipline").
    pub fn on_removed(&mut self, source: impl Into<String>) -> Option<Scan> {
        if self.active {
            self.active = false;
            Some(Scan::removed(source))
        } else {
            None
        }
    }

    /// The worker hit a fault that ends its ability to poll. Per §4.13,
    /// emits `Scan{token:null, reader_error:true}` iff a token was active;
    /// otherwise the worker stops silently.
    pub fn on_fatal(&mut self, source: impl Into<String>) -> Option<Scan> {
        if self.active {
            self.active = false;
            Some(Scan::reader_error(source))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenType;

    fn tok() -> Token {
        Token::new("abc", "hello", TokenType::Ntag, "", "pcsc:Reader 0")
    }

    #[test]
    fn fatal_with_active_token_emits_reader_error_once() {
        let mut t = PresenceTracker::new();
        let _ = t.on_detected("pcsc:Reader 0", tok());
        let scan = t.on_fatal("pcsc:Reader 0").expect("should emit");
        assert!(scan.reader_error);
        assert!(scan.token.is_none());
        assert!(!t.is_active());

        // No token was active anymore, so a second fatal after the first emits nothing.
        assert!(t.on_fatal("pcsc:Reader 0").is_none());
    }

    #[test]
    fn fatal_without_active_token_emits_nothing() {
        let mut t = PresenceTracker::new();
        assert!(t.on_fatal("pcsc:Reader 0").is_none());
    }

    #[test]
    fn normal_removal_is_not_reader_error() {
        let mut t = PresenceTracker::new();
        let _ = t.on_detected("pcsc:Reader 0", tok());
        let scan = t.on_removed("pcsc:Reader 0").expect("should emit");
        assert!(!scan.reader_error);
        assert!(scan.token.is_none());
    }

    #[test]
    fn removal_without_active_token_emits_nothing() {
        let mut t = PresenceTracker::new();
        assert!(t.on_removed("pcsc:Reader 0").is_none());
    }
}

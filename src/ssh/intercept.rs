//! Command interception
//!
//! Input typed by the client arrives in arbitrary chunks (often one keystroke
//! per packet), so triggers are matched against everything written to the
//! shell since the last match, not against single reads.

use crate::config::FakeResponse;

/// Accumulates client input and detects configured triggers
#[derive(Debug, Default)]
pub struct CommandInterceptor {
    rules: Vec<FakeResponse>,
    buffer: Vec<u8>,
}

impl CommandInterceptor {
    pub fn new(rules: Vec<FakeResponse>) -> Self {
        Self {
            rules,
            buffer: Vec::new(),
        }
    }

    /// Whether any trigger is configured
    pub fn is_active(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Record a chunk of input and check the accumulated buffer.
    ///
    /// On a hit the buffer is cleared and the first matching rule returned.
    pub fn observe(&mut self, data: &[u8]) -> Option<&FakeResponse> {
        if !self.is_active() {
            return None;
        }

        self.buffer.extend_from_slice(data);

        let hit = self
            .rules
            .iter()
            .position(|rule| contains(&self.buffer, rule.command_match.as_bytes()))?;

        self.buffer.clear();
        Some(&self.rules[hit])
    }

    /// Bytes seen since the last match
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ls() -> CommandInterceptor {
        CommandInterceptor::new(vec![FakeResponse::new("ls -lha", "this is a test")])
    }

    #[test]
    fn test_match_whole_command() {
        let mut icpt = ls();
        let hit = icpt.observe(b"ls -lha\n").expect("should match");
        assert_eq!(hit.response, b"this is a test");
        assert!(icpt.buffered().is_empty());
    }

    #[test]
    fn test_match_across_keystrokes() {
        let mut icpt = ls();
        for b in b"ls -lh" {
            assert!(icpt.observe(&[*b]).is_none());
        }
        assert_eq!(icpt.buffered(), b"ls -lh");
        assert!(icpt.observe(b"a").is_some());
        assert!(icpt.buffered().is_empty());
    }

    #[test]
    fn test_partial_command_does_not_match() {
        let mut icpt = ls();
        assert!(icpt.observe(b"ls -lh\n").is_none());
        assert_eq!(icpt.buffered(), b"ls -lh\n");
    }

    #[test]
    fn test_match_anywhere_in_buffer() {
        let mut icpt = ls();
        assert!(icpt.observe(b"cd /tmp && ").is_none());
        assert!(icpt.observe(b"ls -lha | head\n").is_some());
    }

    #[test]
    fn test_rematch_after_reset() {
        let mut icpt = ls();
        assert!(icpt.observe(b"ls -lha\n").is_some());
        assert!(icpt.observe(b"ls -l").is_none());
        assert!(icpt.observe(b"ha\n").is_some());
    }

    #[test]
    fn test_first_rule_wins() {
        let mut icpt = CommandInterceptor::new(vec![
            FakeResponse::new("uname", "first"),
            FakeResponse::new("uname -a", "second"),
        ]);
        let hit = icpt.observe(b"uname -a\n").unwrap();
        assert_eq!(hit.response, b"first");
    }

    #[test]
    fn test_later_rule_matches() {
        let mut icpt = CommandInterceptor::new(vec![
            FakeResponse::new("ls -lha", "listing"),
            FakeResponse::new("whoami", "root"),
        ]);
        let hit = icpt.observe(b"whoami\r").unwrap();
        assert_eq!(hit.command_match, "whoami");
    }

    #[test]
    fn test_inactive_does_not_buffer() {
        let mut icpt = CommandInterceptor::new(vec![]);
        assert!(!icpt.is_active());
        assert!(icpt.observe(b"ls -lha\n").is_none());
        assert!(icpt.buffered().is_empty());
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"abc", b"b"));
        assert!(!contains(b"ab", b"abc"));
        assert!(!contains(b"abc", b""));
    }
}

//! Conversation state carried from one turn to the next

use std::fmt;

/// Opaque continuation token plus the volume the service last asked for.
///
/// The token is only ever replaced as a whole; an empty token means the next
/// turn starts a fresh conversation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    continuation_token: Vec<u8>,
    volume_percent: u8,
}

impl ConversationState {
    pub fn new(volume_percent: u8) -> Self {
        Self {
            continuation_token: Vec::new(),
            volume_percent: volume_percent.min(100),
        }
    }

    pub fn continuation_token(&self) -> &[u8] {
        &self.continuation_token
    }

    pub fn has_continuation(&self) -> bool {
        !self.continuation_token.is_empty()
    }

    pub fn volume_percent(&self) -> u8 {
        self.volume_percent
    }

    /// Replace the continuation token wholesale.
    pub fn replace_continuation(&mut self, token: Vec<u8>) {
        self.continuation_token = token;
    }

    pub fn set_volume_percent(&mut self, volume_percent: u8) {
        self.volume_percent = volume_percent.min(100);
    }
}

impl fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationState")
            .field("continuation_token", &format_args!("{} bytes", self.continuation_token.len()))
            .field("volume_percent", &self.volume_percent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = ConversationState::new(50);
        assert!(!state.has_continuation());
        assert_eq!(state.volume_percent(), 50);
    }

    #[test]
    fn test_token_replaced_not_merged() {
        let mut state = ConversationState::new(50);
        state.replace_continuation(b"first-token".to_vec());
        state.replace_continuation(b"t2".to_vec());
        assert_eq!(state.continuation_token(), b"t2");
        assert!(state.has_continuation());
    }

    #[test]
    fn test_debug_hides_token_bytes() {
        let mut state = ConversationState::new(10);
        state.replace_continuation(vec![0xde, 0xad]);
        let text = format!("{:?}", state);
        assert!(text.contains("2 bytes"));
    }
}

use crate::interpreter::TurnVerdict;

/// Progress of a conversation, broadcast to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    TurnStarted { turn: usize },
    TurnFinished { turn: usize, verdict: TurnVerdict },
    ConversationEnded { turns: usize },
    ConversationFailed { turn: usize, error: String },
}

/// Summary of a finished conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationSummary {
    pub turns: usize,
    pub final_verdict: TurnVerdict,
}

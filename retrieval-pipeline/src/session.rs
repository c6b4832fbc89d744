use std::collections::VecDeque;

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
}

/// Bounded, FIFO-evicted history of one QA session.
///
/// Owned by exactly one session; there is no cross-session sharing, so the
/// single-writer discipline is the `&mut` on `record`. Counting a question
/// and its answer as separate entries, the history never holds more than
/// `2 * max_turns` entries.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    pub fn record(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push_back(ConversationTurn {
            question: question.into(),
            answer: answer.into(),
        });
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of entries, counting questions and answers separately.
    pub fn entry_count(&self) -> usize {
        self.turns.len() * 2
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Plain-text rendering for inclusion in a prompt, oldest turn first.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("User: {}\nAssistant: {}", turn.question, turn.answer))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

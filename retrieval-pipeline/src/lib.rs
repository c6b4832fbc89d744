#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod answer;
pub mod scope;
pub mod session;

pub use answer::{
    DefaultQaServices, QaAnswer, QaEngine, QaServices, QaTuning, UNGROUNDED_WARNING,
};
pub use common::storage::index::RetrievedChunk;
pub use scope::{scope, DocIdentifierSet, ScopeOutcome, SCOPE_METADATA_KEYS};
pub use session::{ConversationHistory, ConversationTurn};

//! 记忆层：问答使用的短期对话历史

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};

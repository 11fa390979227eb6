//! 记忆层：对话历史（父指针链）与文件持久化

pub mod history;
pub mod persistence;

pub use history::{HistoryManager, InMemoryHistory};
pub use persistence::FileHistory;

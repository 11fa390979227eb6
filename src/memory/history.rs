//! 对话历史
//!
//! 消息以 parent_id 串成单链；读取时从指定父消息（缺省为会话最后一条）沿 parent 指针回溯到根。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::GatewayError;
use crate::llm::Message;

#[async_trait]
pub trait HistoryManager: Send + Sync {
    /// 取以 parent_id 结尾的消息链（按时间顺序）；parent_id 为空时取会话最后一条
    async fn get_history(&self, parent_id: Option<&str>, conversation_id: &str) -> Result<Vec<Message>, GatewayError>;

    /// 追加（或按 id 覆盖）一条消息
    async fn save_history(&self, message: &Message, conversation_id: &str) -> Result<(), GatewayError>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), GatewayError>;
}

/// 从会话消息中取出以 parent_id（或最后一条）结尾的链
pub(crate) fn chain_from(messages: &[Message], parent_id: Option<&str>) -> Vec<Message> {
    let by_id: HashMap<&str, &Message> = messages.iter().map(|m| (m.id.as_str(), m)).collect();
    let mut cursor = match parent_id {
        Some(id) => by_id.get(id).copied(),
        None => messages.last(),
    };

    let mut chain = Vec::new();
    // 链长不会超过消息数，防止损坏数据形成环
    while let Some(message) = cursor {
        if chain.len() >= messages.len() {
            tracing::warn!(message_id = %message.id, "Cycle detected in history chain");
            break;
        }
        chain.push(message.clone());
        cursor = message.parent_id.as_deref().and_then(|p| by_id.get(p).copied());
    }
    chain.reverse();
    chain
}

pub(crate) fn upsert(messages: &mut Vec<Message>, message: &Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message.clone(),
        None => messages.push(message.clone()),
    }
}

/// 进程内历史（测试与未配置持久化目录时使用）
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 会话中保存的全部消息（按保存顺序）
    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryManager for InMemoryHistory {
    async fn get_history(&self, parent_id: Option<&str>, conversation_id: &str) -> Result<Vec<Message>, GatewayError> {
        let guard = self.conversations.read().await;
        Ok(guard
            .get(conversation_id)
            .map(|messages| chain_from(messages, parent_id))
            .unwrap_or_default())
    }

    async fn save_history(&self, message: &Message, conversation_id: &str) -> Result<(), GatewayError> {
        let mut guard = self.conversations.write().await;
        upsert(guard.entry(conversation_id.to_string()).or_default(), message);
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), GatewayError> {
        self.conversations.write().await.remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chain_walks_parents() {
        let history = InMemoryHistory::new();
        let a = Message::user("a");
        let b = Message::assistant("b").with_parent(Some(a.id.clone()));
        let side = Message::user("side").with_parent(Some(a.id.clone()));
        let c = Message::user("c").with_parent(Some(b.id.clone()));
        for m in [&a, &b, &side, &c] {
            history.save_history(m, "conv").await.unwrap();
        }

        let latest = history.get_history(None, "conv").await.unwrap();
        let texts: Vec<String> = latest.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);

        let branch = history.get_history(Some(&side.id), "conv").await.unwrap();
        let texts: Vec<String> = branch.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["a", "side"]);

        assert!(history.get_history(None, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_upsert() {
        let history = InMemoryHistory::new();
        let mut m = Message::user("v1");
        history.save_history(&m, "conv").await.unwrap();
        m.replace_text("v2");
        history.save_history(&m, "conv").await.unwrap();
        assert_eq!(history.messages("conv").await.len(), 1);
        assert_eq!(history.messages("conv").await[0].text(), "v2");

        history.delete_conversation("conv").await.unwrap();
        assert!(history.messages("conv").await.is_empty());
    }
}

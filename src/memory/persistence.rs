//! 对话持久化
//!
//! 每个会话一个 JSON 文件（`<dir>/<编码后的 conversation_id>.json`，内容为消息数组）。
//! 写入先落到临时文件再重命名；同一进程内的写入由互斥锁串行化。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::GatewayError;
use crate::llm::Message;
use crate::memory::history::{chain_from, upsert, HistoryManager};

#[derive(Debug)]
pub struct FileHistory {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileHistory {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 会话 id 按字节百分号编码后作为文件名：不同 id 不会落到同一文件，也不会逃出目录
    fn path_for(&self, conversation_id: &str) -> PathBuf {
        let mut safe = String::with_capacity(conversation_id.len());
        for byte in conversation_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                safe.push(char::from(byte));
            } else {
                safe.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", safe))
    }

    /// 会话全部消息；文件不存在时返回空 Vec
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, GatewayError> {
        let path = self.path_for(conversation_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(history_error(&path, e)),
        };
        serde_json::from_str(&data).map_err(|e| history_error(&path, e))
    }

    async fn store(&self, conversation_id: &str, messages: &[Message]) -> Result<(), GatewayError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| history_error(&self.dir, e))?;
        let path = self.path_for(conversation_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(messages).map_err(|e| history_error(&path, e))?;
        tokio::fs::write(&tmp, json).await.map_err(|e| history_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| history_error(&path, e))
    }
}

fn history_error(path: &Path, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::History(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl HistoryManager for FileHistory {
    async fn get_history(&self, parent_id: Option<&str>, conversation_id: &str) -> Result<Vec<Message>, GatewayError> {
        let messages = self.load(conversation_id).await?;
        Ok(chain_from(&messages, parent_id))
    }

    async fn save_history(&self, message: &Message, conversation_id: &str) -> Result<(), GatewayError> {
        let _guard = self.write_lock.lock().await;
        let mut messages = self.load(conversation_id).await?;
        upsert(&mut messages, message);
        self.store(conversation_id, &messages).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), GatewayError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(conversation_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(history_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let history = FileHistory::new(dir.path().join("history"));

        let user = Message::user("hi");
        let reply = Message::assistant("hello").with_parent(Some(user.id.clone()));
        history.save_history(&user, "conv/1").await.unwrap();
        history.save_history(&reply, "conv/1").await.unwrap();

        assert!(dir.path().join("history/conv%2F1.json").exists());
        let chain = history.get_history(None, "conv/1").await.unwrap();
        assert_eq!(chain, vec![user.clone(), reply]);

        history.delete_conversation("conv/1").await.unwrap();
        assert!(history.get_history(None, "conv/1").await.unwrap().is_empty());
        // 重复删除不报错
        history.delete_conversation("conv/1").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();
        let history = FileHistory::new(dir.path());
        let err = history.get_history(None, "bad").await.unwrap_err();
        assert!(matches!(err, GatewayError::History(_)));
    }

    #[tokio::test]
    async fn test_similar_ids_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let history = FileHistory::new(dir.path());

        let slash = Message::user("slash");
        let underscore = Message::user("underscore");
        history.save_history(&slash, "conv/1").await.unwrap();
        history.save_history(&underscore, "conv_1").await.unwrap();
        history.save_history(&Message::user("dots"), "../x").await.unwrap();

        assert_eq!(history.get_history(None, "conv/1").await.unwrap(), vec![slash]);
        assert_eq!(history.get_history(None, "conv_1").await.unwrap(), vec![underscore]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
        assert!(dir.path().join("%2E%2E%2Fx.json").exists());
    }
}

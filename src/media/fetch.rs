//! 远程媒体下载

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

/// 单次下载失败原因；重试策略按此分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    /// 声明长度或已读字节超过上限；不重试
    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl FetchError {
    /// 服务端错误、网络错误与超时可重试；4xx 不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status(code) => *code >= 500,
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::TooLarge { .. } => false,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, FetchError::Status(code) if (400..500).contains(code))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// 下载器抽象；测试中用脚本化实现替代网络
///
/// 实现应在读取过程中遵守 max_bytes，超出时返回 TooLarge 而不是把整个响应体读进内存。
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration, max_bytes: usize) -> Result<FetchedMedia, FetchError>;
}

/// 基于 reqwest 的下载器，每次尝试都有独立的硬超时
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_once(&self, url: &str, max_bytes: usize) -> Result<FetchedMedia, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > max_bytes as u64) {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = read_capped(response.bytes_stream(), max_bytes).await?;

        Ok(FetchedMedia { bytes, content_type })
    }
}

/// 逐块读取响应体，累计超过上限立即停止
async fn read_capped<S, B, E>(body: S, max_bytes: usize) -> Result<Vec<u8>, FetchError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FetchError::Network(e.to_string()))?;
        let chunk = chunk.as_ref();
        if bytes.len() + chunk.len() > max_bytes {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }
        bytes.extend_from_slice(chunk);
    }
    Ok(bytes)
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration, max_bytes: usize) -> Result<FetchedMedia, FetchError> {
        match tokio::time::timeout(timeout, self.fetch_once(url, max_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

//! 媒体预处理：把消息中的远程图片/视频/音频下载并内联为 base64
//!
//! - 每次尝试有硬超时（默认 15s），服务端错误/网络错误/超时重试 max_retries 次（默认 1 次，间隔 500ms）
//! - 4xx 与已知会过期的聊天媒体链接直接跳过，不重试，只记 debug 日志
//! - 超过体积上限（声明长度或边读边计）即放弃，不重试
//! - 失败时：图片片段被移除；视频/音频保留原内容
//! - data URI 与非 http(s) 地址原样保留
//!
//! 预处理永不失败，各媒体项并发下载。

mod fetch;
mod mime;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::future::join_all;
use serde::Deserialize;

use crate::llm::{ContentPart, Message};

pub use fetch::{FetchError, FetchedMedia, HttpFetcher, MediaFetcher};
pub use mime::{audio_format, sniff_mime};

/// 媒体预处理策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaPolicy {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_image_bytes: usize,
    pub max_video_bytes: usize,
    pub max_audio_bytes: usize,
    /// 会过期的聊天媒体链接所在主机（后缀匹配）
    pub expiring_hosts: Vec<String>,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_retries: 1,
            retry_delay_ms: 500,
            max_image_bytes: 20 * 1024 * 1024,
            max_video_bytes: 50 * 1024 * 1024,
            max_audio_bytes: 25 * 1024 * 1024,
            expiring_hosts: vec![
                "multimedia.nt.qq.com.cn".to_string(),
                "gchat.qpic.cn".to_string(),
            ],
        }
    }
}

impl MediaPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn is_expiring(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        self.expiring_hosts
            .iter()
            .any(|h| host == h.as_str() || host.ends_with(&format!(".{}", h)))
    }

    fn max_bytes(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
            MediaKind::Audio => self.max_audio_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// 预处理器：策略 + 下载器
#[derive(Clone)]
pub struct MediaPreprocessor {
    policy: MediaPolicy,
    fetcher: Arc<dyn MediaFetcher>,
}

impl MediaPreprocessor {
    pub fn new(policy: MediaPolicy, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { policy, fetcher }
    }

    pub fn http(policy: MediaPolicy) -> Self {
        Self::new(policy, Arc::new(HttpFetcher::new()))
    }

    pub fn policy(&self) -> &MediaPolicy {
        &self.policy
    }

    pub async fn process(&self, messages: &[Message]) -> Vec<Message> {
        preprocess_messages(messages, &self.policy, self.fetcher.as_ref()).await
    }
}

impl std::fmt::Debug for MediaPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPreprocessor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// 内联消息列表中的远程媒体，返回新的消息列表
pub async fn preprocess_messages(
    messages: &[Message],
    policy: &MediaPolicy,
    fetcher: &dyn MediaFetcher,
) -> Vec<Message> {
    // (消息下标, 片段下标, 类型, 地址)
    let targets: Vec<(usize, usize, MediaKind, String)> = messages
        .iter()
        .enumerate()
        .flat_map(|(mi, m)| {
            m.content
                .iter()
                .enumerate()
                .filter_map(move |(pi, part)| remote_target(part).map(|(kind, url)| (mi, pi, kind, url)))
        })
        .collect();

    if targets.is_empty() {
        return messages.to_vec();
    }

    let resolved = join_all(
        targets
            .iter()
            .map(|(_, _, kind, url)| resolve(*kind, url, policy, fetcher)),
    )
    .await;

    let mut out = messages.to_vec();
    let mut removed: Vec<(usize, usize)> = Vec::new();
    for ((mi, pi, kind, _), replacement) in targets.iter().zip(resolved) {
        match replacement {
            Some(part) => out[*mi].content[*pi] = part,
            None if *kind == MediaKind::Image => removed.push((*mi, *pi)),
            None => {}
        }
    }
    // 倒序删除，保持其余下标有效
    for (mi, pi) in removed.into_iter().rev() {
        out[mi].content.remove(pi);
    }
    out
}

fn remote_target(part: &ContentPart) -> Option<(MediaKind, String)> {
    let (kind, url) = match part {
        ContentPart::Image { url } => (MediaKind::Image, url),
        ContentPart::Video { url } => (MediaKind::Video, url),
        ContentPart::Audio { data, .. } => (MediaKind::Audio, data),
        _ => return None,
    };
    is_remote(url).then(|| (kind, url.clone()))
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    Some(host.split(':').next().unwrap_or(host))
}

/// 下载并编码单个媒体项；失败返回 None
async fn resolve(kind: MediaKind, url: &str, policy: &MediaPolicy, fetcher: &dyn MediaFetcher) -> Option<ContentPart> {
    let limit = policy.max_bytes(kind);
    let media = match fetch_with_retry(url, limit, policy, fetcher).await {
        Ok(media) if media.bytes.len() <= limit => media,
        Ok(media) => {
            tracing::warn!(kind = kind.as_str(), url, size = media.bytes.len(), limit, "Media exceeds size limit, skipping");
            return None;
        }
        Err(FetchError::TooLarge { limit }) => {
            tracing::warn!(kind = kind.as_str(), url, limit, "Media exceeds size limit, skipping");
            return None;
        }
        Err(err) => {
            if err.is_client_error() || policy.is_expiring(url) {
                tracing::debug!(kind = kind.as_str(), url, error = %err, "Media unavailable, skipping");
            } else {
                tracing::warn!(kind = kind.as_str(), url, error = %err, "Media fetch failed after retries, skipping");
            }
            return None;
        }
    };

    let mime = sniff_mime(&media.bytes, media.content_type.as_deref(), url);
    let data = base64::engine::general_purpose::STANDARD.encode(&media.bytes);
    let part = match kind {
        MediaKind::Image => ContentPart::Image {
            url: format!("data:{};base64,{}", mime, data),
        },
        MediaKind::Video => ContentPart::Video {
            url: format!("data:{};base64,{}", mime, data),
        },
        MediaKind::Audio => ContentPart::Audio {
            data,
            format: audio_format(&mime),
        },
    };
    Some(part)
}

/// 只对可重试的错误重试；4xx 与过期链接第一次失败即返回
async fn fetch_with_retry(
    url: &str,
    max_bytes: usize,
    policy: &MediaPolicy,
    fetcher: &dyn MediaFetcher,
) -> Result<FetchedMedia, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match fetcher.fetch(url, policy.timeout(), max_bytes).await {
            Ok(media) => return Ok(media),
            Err(err) if err.is_retryable() && !policy.is_expiring(url) && attempt < policy.max_retries => {
                attempt += 1;
                tracing::debug!(url, attempt, error = %err, "Retrying media fetch");
                tokio::time::sleep(policy.retry_delay()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

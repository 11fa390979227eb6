//! 基于 reqwest 的 HTTP 辅助：状态码检查与逐事件读取 Server-Sent Events 响应
//!
//! SSE 分帧交给 reqwest-eventsource；非 2xx 响应统一转为带上游错误信息的 Provider 错误。

use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;

use crate::core::GatewayError;
use crate::llm::ProviderKind;

/// 非 2xx 时读出响应体中的错误信息（`{"error": {"message": ...}}`），转为 Provider 错误
pub(crate) async fn check_status(kind: ProviderKind, response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(status_error(kind, response).await)
}

async fn status_error(kind: ProviderKind, response: reqwest::Response) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    GatewayError::Provider {
        provider: kind,
        message: format!("HTTP {}: {}", status.as_u16(), error_detail(&body)),
    }
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// 发起流式请求并逐个交出事件的 data 载荷；回调返回 false 时提前结束
///
/// 事件源在任何退出路径上都会关闭，不会触发自动重连。
pub(crate) async fn read_events<F>(kind: ProviderKind, request: reqwest::RequestBuilder, mut on_event: F) -> Result<(), GatewayError>
where
    F: FnMut(&str) -> Result<bool, GatewayError>,
{
    let mut source = EventSource::new(request).map_err(|e| GatewayError::Network(e.to_string()))?;
    let outcome = loop {
        match source.next().await {
            None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => break Ok(()),
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => match on_event(&message.data) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            },
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(_, response))) => {
                break Err(status_error(kind, response).await)
            }
            Some(Err(e)) => break Err(GatewayError::Network(format!("event stream: {}", e))),
        }
    };
    source.close();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_prefers_message() {
        assert_eq!(
            error_detail(r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            "Overloaded"
        );
        assert_eq!(error_detail("Bad Gateway"), "Bad Gateway");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let request = reqwest::Client::new().post("http://127.0.0.1:9/v1/messages");
        let err = read_events(ProviderKind::Claude, request, |_| Ok(true)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
    }
}

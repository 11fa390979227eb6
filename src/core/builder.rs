//! Gateway 构建器：统一的初始化逻辑
//!
//! 测试中直接注入适配器 / 历史 / 工具；CLI 等接入方通过 from_config 按配置组装全部组件。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, ConversationSection};
use crate::core::keys::{KeyResolver, KeyStrategy};
use crate::core::orchestrator::Gateway;
use crate::core::state::SignatureRules;
use crate::core::GatewayError;
use crate::llm::{create_adapter, ProviderAdapter, ProviderKind};
use crate::media::MediaPreprocessor;
use crate::memory::{FileHistory, HistoryManager, InMemoryHistory};
use crate::tools::{ToolExecutor, ToolRegistry};

pub struct GatewayBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    history: Option<Arc<dyn HistoryManager>>,
    tools: Option<ToolRegistry>,
    executor: Option<ToolExecutor>,
    keys: KeyResolver,
    conversation: ConversationSection,
    signature_rules: SignatureRules,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    stream: bool,
    request_timeout: Duration,
}

impl GatewayBuilder {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            history: None,
            tools: None,
            executor: None,
            keys: KeyResolver::default(),
            conversation: ConversationSection::default(),
            signature_rules: SignatureRules::default(),
            temperature: None,
            max_tokens: None,
            stream: false,
            request_timeout: Duration::from_secs(120),
        }
    }

    /// 按配置组装：供应商适配器（含媒体预处理）、Key 池、历史、内置工具与调度参数
    pub fn from_config(cfg: &AppConfig) -> Result<Self, GatewayError> {
        let kind = ProviderKind::from_str(&cfg.llm.provider)?;
        let media = MediaPreprocessor::http(cfg.media.clone());
        let adapter = create_adapter(kind, cfg.llm.base_url.as_deref(), cfg.llm.model.as_deref(), Some(media));

        let history: Arc<dyn HistoryManager> = match &cfg.history.dir {
            Some(dir) => Arc::new(FileHistory::new(dir)),
            None => Arc::new(InMemoryHistory::new()),
        };

        let tools = Arc::new(ToolRegistry::with_builtins());
        let executor = ToolExecutor::new(tools, cfg.tools.tool_timeout_secs)
            .with_order_sensitive(cfg.tools.order_sensitive.iter().cloned())
            .with_send_interval(Duration::from_millis(cfg.tools.send_interval_ms))
            .with_max_parallel(cfg.tools.max_parallel);

        let mut builder = Self::new(adapter)
            .history(history)
            .executor(executor)
            .api_keys(&cfg.llm.api_key, cfg.llm.key_strategy)
            .conversation(cfg.conversation.clone())
            .signature_rules(cfg.tools.signature_rules())
            .stream(cfg.llm.stream)
            .request_timeout(Duration::from_secs(cfg.llm.timeouts.request));
        builder.temperature = cfg.llm.temperature;
        builder.max_tokens = cfg.llm.max_tokens;
        Ok(builder)
    }

    pub fn history(mut self, history: Arc<dyn HistoryManager>) -> Self {
        self.history = Some(history);
        self
    }

    /// 使用默认调度参数的工具注册表；与 executor 二选一
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn api_keys(mut self, pool: &str, strategy: KeyStrategy) -> Self {
        self.keys = KeyResolver::from_pool(pool, strategy);
        self
    }

    pub fn conversation(mut self, conversation: ConversationSection) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.conversation.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn signature_rules(mut self, rules: SignatureRules) -> Self {
        self.signature_rules = rules;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Gateway, GatewayError> {
        if self.keys.is_empty() {
            return Err(GatewayError::NoApiKey);
        }
        let executor = match (self.executor, self.tools) {
            (Some(executor), _) => executor,
            (None, Some(tools)) => ToolExecutor::new(Arc::new(tools), 30),
            (None, None) => ToolExecutor::new(Arc::new(ToolRegistry::new()), 30),
        };
        let history = self.history.unwrap_or_else(|| Arc::new(InMemoryHistory::new()));

        tracing::info!(
            provider = %self.adapter.kind(),
            model = %self.adapter.default_model(),
            keys = self.keys.len(),
            tools = executor.registry().len(),
            "Gateway ready"
        );
        Ok(Gateway {
            adapter: self.adapter,
            executor: Arc::new(executor),
            history,
            keys: Arc::new(self.keys),
            conversation: self.conversation,
            signature_rules: self.signature_rules,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            request_timeout: self.request_timeout,
        })
    }
}

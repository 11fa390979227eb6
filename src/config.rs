//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=gemini`）。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::keys::KeyStrategy;
use crate::core::state::{LoopLimits, SignatureRules};
use crate::media::MediaPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub conversation: ConversationSection,
    pub tools: ToolsSection,
    pub media: MediaPolicy,
    pub history: HistorySection,
}

/// [llm] 段：供应商、模型、Key 池与请求参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / gemini / claude
    pub provider: String,
    /// 为空时使用供应商默认模型
    pub model: Option<String>,
    /// 单个 Key，或以逗号/换行分隔的 Key 池
    pub api_key: String,
    pub key_strategy: KeyStrategy,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_key: String::new(),
            key_strategy: KeyStrategy::default(),
            base_url: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 整轮请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// 按模型名强制收尾的轮数（子串匹配，不区分大小写）
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ForceFinalRule {
    pub model_pattern: String,
    pub rounds: usize,
}

/// [conversation] 段：system prompt 与工具循环限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub system_prompt: Option<String>,
    pub max_consecutive_rounds: usize,
    pub max_consecutive_identical: usize,
    pub max_total_calls: usize,
    pub max_signature_repeats: usize,
    /// 工具轮数达到该值后，下一轮强制 tool_choice = none
    pub force_final_after_rounds: usize,
    pub force_final_overrides: Vec<ForceFinalRule>,
}

impl Default for ConversationSection {
    fn default() -> Self {
        let limits = LoopLimits::default();
        Self {
            system_prompt: None,
            max_consecutive_rounds: limits.max_consecutive_rounds,
            max_consecutive_identical: limits.max_consecutive_identical,
            max_total_calls: limits.max_total_calls,
            max_signature_repeats: limits.max_signature_repeats,
            force_final_after_rounds: 10,
            force_final_overrides: vec![ForceFinalRule {
                model_pattern: "gemini".to_string(),
                rounds: 6,
            }],
        }
    }
}

impl ConversationSection {
    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_consecutive_rounds: self.max_consecutive_rounds,
            max_consecutive_identical: self.max_consecutive_identical,
            max_total_calls: self.max_total_calls,
            max_signature_repeats: self.max_signature_repeats,
        }
    }

    /// 某模型的强制收尾轮数：第一条匹配的覆盖规则，否则取全局值
    pub fn force_final_rounds(&self, model: &str) -> usize {
        let model = model.to_lowercase();
        self.force_final_overrides
            .iter()
            .find(|rule| model.contains(&rule.model_pattern.to_lowercase()))
            .map(|rule| rule.rounds)
            .unwrap_or(self.force_final_after_rounds)
    }
}

/// [tools] 段：超时、调度与签名规则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 会向终端用户发出可见消息的工具，严格串行
    pub order_sensitive: Vec<String>,
    pub send_interval_ms: u64,
    pub max_parallel: usize,
    pub addressing_fields: HashMap<String, Vec<String>>,
    pub shell_tools: HashSet<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        let rules = SignatureRules::default();
        Self {
            tool_timeout_secs: 30,
            order_sensitive: ["send_message", "send_private_message", "send_group_message", "reply", "poke", "at_user"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            send_interval_ms: 300,
            max_parallel: 8,
            addressing_fields: rules.addressing_fields,
            shell_tools: rules.shell_tools,
        }
    }
}

impl ToolsSection {
    pub fn signature_rules(&self) -> SignatureRules {
        SignatureRules {
            addressing_fields: self.addressing_fields.clone(),
            shell_tools: self.shell_tools.clone(),
        }
    }
}

/// [history] 段：设置 dir 时使用文件持久化，否则为进程内历史
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HistorySection {
    pub dir: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

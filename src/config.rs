//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__RUNTIME__MAX_STEPS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::react::ToolChoice;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeSection,
    pub context: ContextSection,
    pub tools: ToolsSection,
    pub llm: LlmSection,
}

/// [runtime] 段：步数上限、单步超时、溢出重试次数、卡住检测阈值、调用模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_steps: usize,
    pub step_timeout_secs: u64,
    /// 单步内 context-overflow 的最大重试次数
    pub max_overflow_retries: u32,
    /// 相同 assistant 内容重复多少次视为卡住
    pub duplicate_threshold: usize,
    pub tool_choice: ToolChoice,
    /// 每步追加的固定提示（可选）
    pub next_step_prompt: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            step_timeout_secs: 120,
            max_overflow_retries: 2,
            duplicate_threshold: 2,
            tool_choice: ToolChoice::Auto,
            next_step_prompt: None,
        }
    }
}

/// [context] 段：上下文预算（token 估算单位）、压缩时是否折叠摘要、运行记录目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub budget_tokens: usize,
    pub summarize: bool,
    /// 设置后每次运行结束写出 `{dir}/{run_id}.json`
    pub transcript_dir: Option<PathBuf>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            budget_tokens: 8000,
            summarize: true,
            transcript_dir: None,
        }
    }
}

/// [tools] 段：并行开关、并发上限、单次调用超时、观察结果截断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub parallel: bool,
    pub max_concurrent: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 成功输出最多保留的字符数
    pub max_observe: Option<usize>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            parallel: true,
            max_concurrent: 3,
            tool_timeout_secs: 30,
            max_observe: None,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai；openai 还需要 OPENAI_API_KEY
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

//! bee-runtime
//!
//! 入口：初始化日志、加载配置、构建运行时，以命令行参数作为用户输入跑一次，输出 FinalResult（JSON）。

use anyhow::Context;
use bee_runtime::{agent::Runtime, config::load_config, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let input = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if input.trim().is_empty() {
        anyhow::bail!("usage: bee-runtime <prompt>");
    }

    let cfg = load_config(None).context("Failed to load config")?;
    let runtime = Runtime::from_config(cfg);

    let result = runtime.start(&input).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

//! 运行记录持久化
//!
//! 一次运行结束后把完整上下文与 FinalResult 写出，供排查与回放；写失败只记日志，不影响运行结果。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::FinalResult;
use crate::memory::Turn;

/// 单次运行的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
    pub result: FinalResult,
}

/// 运行记录的去处
pub trait TranscriptSink: Send + Sync {
    fn record(&self, transcript: &Transcript) -> anyhow::Result<()>;
}

/// 丢弃一切
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TranscriptSink for NoopSink {
    fn record(&self, _transcript: &Transcript) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 每次运行一个 JSON 文件：`{dir}/{run_id}.json`
#[derive(Debug)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// 读回某次运行的记录；文件不存在时返回 None
    pub fn load(&self, run_id: &str) -> anyhow::Result<Option<Transcript>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

impl TranscriptSink for JsonFileSink {
    fn record(&self, transcript: &Transcript) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(
            self.path_for(&transcript.run_id),
            serde_json::to_string_pretty(transcript)?,
        )?;
        Ok(())
    }
}

//! Append-only decision log.
//!
//! One JSON object per line in `docs/decisions/decisions.jsonl`. Lines are
//! only ever appended, under an exclusive advisory lock so concurrent
//! writers never interleave partial lines. A line torn by an interrupted
//! write is sealed with a newline by the next append and skipped on read.
//!
//! Integrity is per record only: entries are not hash-chained, so the log
//! does not prove that no line was removed or reordered.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const DECISIONS_FILE: &str = "docs/decisions/decisions.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Vision,
    Technical,
    Tradeoff,
    Explicit,
}

impl std::str::FromStr for DecisionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vision" => Ok(DecisionType::Vision),
            "technical" => Ok(DecisionType::Technical),
            "tradeoff" => Ok(DecisionType::Tradeoff),
            "explicit" => Ok(DecisionType::Explicit),
            _ => anyhow::bail!(
                "Invalid decision type '{}'. Valid values: vision, technical, tradeoff, explicit",
                s
            ),
        }
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionType::Vision => "vision",
            DecisionType::Technical => "technical",
            DecisionType::Tradeoff => "tradeoff",
            DecisionType::Explicit => "explicit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The Unix epoch means "unset"; it is replaced with the write time.
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    #[serde(default)]
    pub feature_id: String,
    #[serde(default)]
    pub workstream_id: String,
    pub question: String,
    pub decision: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub decision_maker: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Decision {
    pub fn new(
        decision_type: DecisionType,
        question: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: epoch(),
            decision_type,
            feature_id: String::new(),
            workstream_id: String::new(),
            question: question.into(),
            decision: decision.into(),
            rationale: String::new(),
            alternatives: Vec::new(),
            decision_maker: String::new(),
        }
    }

    fn matches(&self, needle: &str) -> bool {
        [&self.question, &self.decision, &self.rationale]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Clone)]
pub struct DecisionLog {
    path: PathBuf,
}

impl DecisionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log at the conventional location under `project_dir`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(DECISIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one decision. An unset timestamp is filled with the current
    /// time; every other field is written verbatim.
    pub fn log(&self, mut decision: Decision) -> Result<Decision> {
        if decision.timestamp == epoch() {
            decision.timestamp = Utc::now();
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut line = serde_json::to_string(&decision).context("Failed to serialize decision")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open decision log {}", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock decision log {}", self.path.display()))?;
        let written = append_line(&mut file, &line)
            .with_context(|| format!("Failed to append to {}", self.path.display()));
        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not unlock decision log");
        }
        written?;

        tracing::debug!(kind = %decision.decision_type, feature = %decision.feature_id, "decision logged");
        Ok(decision)
    }

    /// Read every decision. A line that fails to decode is skipped with a
    /// warning; an I/O error ends the read and everything before it is
    /// returned.
    pub fn load_all(&self) -> Result<Vec<Decision>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open decision log {}", self.path.display()));
            }
        };

        let mut decisions = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = index + 1, error = %e, "decision log unreadable; stopping");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Decision>(&line) {
                Ok(d) => decisions.push(d),
                Err(e) => {
                    tracing::warn!(line = index + 1, error = %e, "corrupt decision log line; skipping");
                }
            }
        }
        Ok(decisions)
    }

    /// Page through the log. An offset past the end yields an empty page.
    pub fn load(&self, offset: usize, limit: usize) -> Result<Vec<Decision>> {
        Ok(self
            .load_all()?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// Case-insensitive substring search over question, decision and
    /// rationale.
    pub fn search(&self, query: &str) -> Result<Vec<Decision>> {
        let needle = query.to_lowercase();
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|d| d.matches(&needle))
            .collect())
    }

    pub fn by_feature(&self, feature_id: &str) -> Result<Vec<Decision>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|d| d.feature_id == feature_id)
            .collect())
    }
}

/// Write `line` at the end of `file`, first terminating a torn last line.
/// The caller holds the lock.
fn append_line(file: &mut fs::File, line: &str) -> std::io::Result<()> {
    let mut sealed = String::with_capacity(line.len() + 1);
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            sealed.push('\n');
        }
    }
    sealed.push_str(line);
    file.write_all(sealed.as_bytes())?;
    file.flush()
}

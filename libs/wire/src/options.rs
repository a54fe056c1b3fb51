//! Execution options accepted by `POST /tasks/run`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};

pub const MIN_TURNS: u32 = 1;
pub const MAX_TURNS: u32 = 20;
pub const DEFAULT_MAX_TURNS: u32 = 5;

pub const MIN_TIMEOUT_MS: u64 = 60_000;
pub const MAX_TIMEOUT_MS: u64 = 1_200_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Tools the execution engine may be allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllowedTool {
    Bash,
    Read,
    Write,
    WebSearch,
    Edit,
}

impl AllowedTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "Bash",
            Self::Read => "Read",
            Self::Write => "Write",
            Self::WebSearch => "WebSearch",
            Self::Edit => "Edit",
        }
    }
}

impl std::fmt::Display for AllowedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AllowedTool {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bash" => Ok(Self::Bash),
            "Read" => Ok(Self::Read),
            "Write" => Ok(Self::Write),
            "WebSearch" => Ok(Self::WebSearch),
            "Edit" => Ok(Self::Edit),
            other => Err(WireError::InvalidOptions(format!("unknown tool '{other}'"))),
        }
    }
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_allowed_tools() -> Vec<AllowedTool> {
    vec![AllowedTool::Bash, AllowedTool::Read, AllowedTool::WebSearch]
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Per-task execution options. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<AllowedTool>,

    /// Hard execution timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            allowed_tools: default_allowed_tools(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RunOptions {
    /// Checks the numeric bounds.
    pub fn validate(&self) -> WireResult<()> {
        if !(MIN_TURNS..=MAX_TURNS).contains(&self.max_turns) {
            return Err(WireError::InvalidOptions(format!(
                "maxTurns must be between {MIN_TURNS} and {MAX_TURNS}, got {}",
                self.max_turns
            )));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(WireError::InvalidOptions(format!(
                "timeoutMs must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}, got {}",
                self.timeout_ms
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

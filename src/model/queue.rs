use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Started,
    Stopped,
    Paused,
}

impl QueueState {
    /// A stopped queue refuses intake; started and paused queues accept it.
    pub fn accepts_intake(self) -> bool {
        !matches!(self, QueueState::Stopped)
    }

    /// Only started queues dispatch.
    pub fn dispatches(self) -> bool {
        matches!(self, QueueState::Started)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Started => write!(f, "started"),
            QueueState::Stopped => write!(f, "stopped"),
            QueueState::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(QueueState::Started),
            "stopped" => Ok(QueueState::Stopped),
            "paused" => Ok(QueueState::Paused),
            other => Err(format!("unknown queue state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl std::fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueuePriority::Critical => write!(f, "critical"),
            QueuePriority::High => write!(f, "high"),
            QueuePriority::Normal => write!(f, "normal"),
            QueuePriority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for QueuePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueuePriority::Critical),
            "high" => Ok(QueuePriority::High),
            "normal" => Ok(QueuePriority::Normal),
            "low" => Ok(QueuePriority::Low),
            other => Err(format!("unknown queue priority '{other}'")),
        }
    }
}

/// Policy by which a queue picks a worker among eligibles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    Priority,
}

impl DispatchStrategy {
    pub fn all() -> [DispatchStrategy; 4] {
        [
            DispatchStrategy::RoundRobin,
            DispatchStrategy::LeastLoaded,
            DispatchStrategy::Random,
            DispatchStrategy::Priority,
        ]
    }

    pub fn description(self) -> &'static str {
        match self {
            DispatchStrategy::RoundRobin => "Distribute jobs evenly across workers in rotation",
            DispatchStrategy::LeastLoaded => "Send jobs to the worker with the least current load",
            DispatchStrategy::Random => "Randomly select a worker for each job",
            DispatchStrategy::Priority => "Prefer local workers, then fall back to least loaded",
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStrategy::RoundRobin => write!(f, "round_robin"),
            DispatchStrategy::LeastLoaded => write!(f, "least_loaded"),
            DispatchStrategy::Random => write!(f, "random"),
            DispatchStrategy::Priority => write!(f, "priority"),
        }
    }
}

impl std::str::FromStr for DispatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(DispatchStrategy::RoundRobin),
            "least_loaded" => Ok(DispatchStrategy::LeastLoaded),
            "random" => Ok(DispatchStrategy::Random),
            "priority" => Ok(DispatchStrategy::Priority),
            other => Err(format!("unknown dispatch strategy '{other}'")),
        }
    }
}

/// A named dispatch lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub priority: QueuePriority,
    pub strategy: DispatchStrategy,
    pub state: QueueState,
    pub is_default: bool,
    /// Per-job time limit in seconds, forwarded to workers.
    pub time_limit_secs: i64,
    /// Round-robin cursor; advances on every selection attempt.
    pub rr_cursor: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

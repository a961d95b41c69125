//! Hard numeric budgets for a workflow run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Limits on iterations, subagent calls and wall time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowBudget {
    pub max_iterations: u32,
    pub max_subagent_calls: u32,
    #[serde(with = "humantime_duration")]
    pub max_wall_time: Duration,
}

impl Default for WorkflowBudget {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_subagent_calls: 30,
            max_wall_time: Duration::from_secs(15 * 60),
        }
    }
}

/// Which limit ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Iterations,
    SubagentCalls,
    WallTime,
}

/// Resources used so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConsumed {
    pub iterations: u32,
    pub subagent_calls: u32,
    #[serde(with = "humantime_duration")]
    pub wall_time: Duration,
}

impl WorkflowBudget {
    pub fn new(max_iterations: u32, max_subagent_calls: u32, max_wall_time: Duration) -> Self {
        Self {
            max_iterations,
            max_subagent_calls,
            max_wall_time,
        }
    }

    /// Default override applied by a strategy switch.
    pub fn strategy_switch_default() -> Self {
        Self {
            max_iterations: 2,
            max_subagent_calls: 5,
            max_wall_time: Duration::from_secs(2 * 60),
        }
    }

    /// The first limit that `consumed` has reached, if any.
    ///
    /// Iterations are checked first, then subagent calls, then wall time.
    pub fn exhausted_by(&self, consumed: &BudgetConsumed) -> Option<BudgetLimit> {
        if consumed.iterations >= self.max_iterations {
            Some(BudgetLimit::Iterations)
        } else if consumed.subagent_calls >= self.max_subagent_calls {
            Some(BudgetLimit::SubagentCalls)
        } else if consumed.wall_time >= self.max_wall_time {
            Some(BudgetLimit::WallTime)
        } else {
            None
        }
    }

    /// Replace the remaining budget with `switch`, counted from `consumed`.
    ///
    /// The result never exceeds the current limits: a strategy switch can
    /// only shrink a budget.
    pub fn narrowed(&self, consumed: &BudgetConsumed, switch: &WorkflowBudget) -> WorkflowBudget {
        WorkflowBudget {
            max_iterations: self
                .max_iterations
                .min(consumed.iterations.saturating_add(switch.max_iterations)),
            max_subagent_calls: self
                .max_subagent_calls
                .min(consumed.subagent_calls.saturating_add(switch.max_subagent_calls)),
            max_wall_time: self
                .max_wall_time
                .min(consumed.wall_time.saturating_add(switch.max_wall_time)),
        }
    }
}

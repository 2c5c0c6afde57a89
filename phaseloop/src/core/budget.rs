//! Cycle budget: a soft minimum and a hard maximum on phase executions.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleBudget {
    /// Cycles to complete before an empty plan ends the session.
    pub min_cycles: u32,
    /// Absolute ceiling; always wins over the minimum and over pending work.
    pub max_cycles: u32,
}

/// What to do when no pending task is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Minimum satisfied: the plan is exhausted for this run.
    Exhausted,
    /// Minimum not yet satisfied: wait for tasks to be appended.
    WaitForTasks,
}

impl CycleBudget {
    pub fn new(min_cycles: u32, max_cycles: u32) -> Result<Self> {
        let budget = Self {
            min_cycles,
            max_cycles,
        };
        budget.validate()?;
        Ok(budget)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be > 0"));
        }
        if self.max_cycles < self.min_cycles {
            return Err(anyhow!(
                "max_cycles ({}) must be >= min_cycles ({})",
                self.max_cycles,
                self.min_cycles
            ));
        }
        Ok(())
    }

    pub fn ceiling_reached(&self, completed: u32) -> bool {
        completed >= self.max_cycles
    }

    pub fn minimum_met(&self, completed: u32) -> bool {
        completed >= self.min_cycles
    }

    pub fn on_empty_plan(&self, completed: u32) -> IdleDecision {
        if self.minimum_met(completed) {
            IdleDecision::Exhausted
        } else {
            IdleDecision::WaitForTasks
        }
    }
}

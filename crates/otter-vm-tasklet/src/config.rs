//! Tasklet engine configuration

use crate::error::{TaskletError, TaskletResult};

/// Environment variable controlling generational aging of suspended chains
pub const AGING_ENV_VAR: &str = "OTTER_TASKLET_AGING";

/// Tasklet engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskletConfig {
    /// Age and rejuvenate suspended chains between collections.
    ///
    /// When disabled every registered chain is rescanned on every
    /// applicable collection.
    pub aging_enabled: bool,
    /// Outgoing argument area that must be captured even when the callee
    /// did not use it (Windows x64 shadow store: 32 bytes).
    pub min_outgoing_arg_area: u32,
}

impl Default for TaskletConfig {
    fn default() -> Self {
        Self {
            aging_enabled: true,
            min_outgoing_arg_area: if cfg!(all(windows, target_arch = "x86_64")) {
                32
            } else {
                0
            },
        }
    }
}

impl TaskletConfig {
    /// Build a configuration from the process environment.
    ///
    /// Values that do not parse are logged and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(AGING_ENV_VAR) {
            match Self::parse_flag(AGING_ENV_VAR, &raw) {
                Ok(enabled) => config.aging_enabled = enabled,
                Err(err) => {
                    tracing::warn!(target: "otter::tasklet", %err, "ignoring tasklet configuration");
                }
            }
        }
        config
    }

    /// Disable aging (every chain is rescanned on every collection)
    pub fn without_aging(mut self) -> Self {
        self.aging_enabled = false;
        self
    }

    /// Strictly parse a boolean flag value
    pub fn parse_flag(var: &'static str, value: &str) -> TaskletResult<bool> {
        let trimmed = value.trim();
        if ["1", "true", "on", "yes"]
            .iter()
            .any(|word| trimmed.eq_ignore_ascii_case(word))
        {
            return Ok(true);
        }
        if ["0", "false", "off", "no"]
            .iter()
            .any(|word| trimmed.eq_ignore_ascii_case(word))
        {
            return Ok(false);
        }
        Err(TaskletError::InvalidConfig {
            var,
            value: value.to_string(),
        })
    }
}

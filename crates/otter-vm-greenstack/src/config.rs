//! Green stack configuration

use crate::error::{GreenStackError, GreenStackResult};

/// Environment variable overriding the minimum segment size
pub const SEGMENT_ENV_VAR: &str = "OTTER_GREEN_STACK_SEGMENT";
/// Environment variable overriding the first segment size
pub const INITIAL_ENV_VAR: &str = "OTTER_GREEN_STACK_INITIAL";

/// Segment sizing for green thread stacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreenStackConfig {
    /// Smallest usable size of a segment added when the stack grows
    pub min_segment_size: usize,
    /// Unused guard area below each segment's limit
    pub red_zone_size: usize,
    /// Usable size of the first segment of a green thread
    pub initial_segment_size: usize,
}

impl Default for GreenStackConfig {
    fn default() -> Self {
        Self {
            min_segment_size: 8 * 1024,
            red_zone_size: 4 * 1024,
            initial_segment_size: 256 * 1024,
        }
    }
}

impl GreenStackConfig {
    /// Build a configuration from the process environment.
    ///
    /// Values that do not parse are logged and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for (var, field) in [
            (SEGMENT_ENV_VAR, &mut config.min_segment_size),
            (INITIAL_ENV_VAR, &mut config.initial_segment_size),
        ] {
            let Ok(raw) = std::env::var(var) else {
                continue;
            };
            match Self::parse_size(var, &raw) {
                Ok(size) => *field = size,
                Err(err) => {
                    tracing::warn!(target: "otter::green", %err, "ignoring green stack configuration");
                }
            }
        }
        config
    }

    /// Parse a byte count, accepting an optional `k`/`m` suffix
    pub fn parse_size(var: &'static str, value: &str) -> GreenStackResult<usize> {
        let invalid = || GreenStackError::InvalidConfig {
            var,
            value: value.to_string(),
        };
        let trimmed = value.trim().to_ascii_lowercase();
        let (digits, scale) = match trimmed.as_bytes().last() {
            Some(b'k') => (&trimmed[..trimmed.len() - 1], 1024),
            Some(b'm') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
            _ => (trimmed.as_str(), 1),
        };
        let size: usize = digits.parse().map_err(|_| invalid())?;
        match size.checked_mul(scale) {
            Some(bytes) if bytes > 0 => Ok(bytes),
            _ => Err(invalid()),
        }
    }
}

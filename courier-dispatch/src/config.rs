use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{pacing::PacingPolicy, render::RenderConfig};

/// Settings for dispatch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Entries claimed per run.
    ///
    /// Default: 20
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Delay between successful sends, in milliseconds.
    ///
    /// Default: 1000
    #[serde(default = "defaults::pacing_interval_ms")]
    pub pacing_interval_ms: u64,

    /// Run the dispatcher on this interval while serving. When unset, runs
    /// only happen on request.
    #[serde(default)]
    pub run_interval_secs: Option<u64>,

    pub render: RenderConfig,
}

impl DispatchConfig {
    #[must_use]
    pub fn new(render: RenderConfig) -> Self {
        Self {
            batch_size: defaults::batch_size(),
            pacing_interval_ms: defaults::pacing_interval_ms(),
            run_interval_secs: None,
            render,
        }
    }

    #[must_use]
    pub const fn pacing(&self) -> PacingPolicy {
        PacingPolicy::new(
            Duration::from_millis(self.pacing_interval_ms),
            self.batch_size,
        )
    }

    #[must_use]
    pub fn run_interval(&self) -> Option<Duration> {
        self.run_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

mod defaults {
    use crate::pacing::PacingPolicy;

    pub const fn batch_size() -> usize {
        PacingPolicy::DEFAULT_BATCH_SIZE
    }

    pub const fn pacing_interval_ms() -> u64 {
        1000
    }
}

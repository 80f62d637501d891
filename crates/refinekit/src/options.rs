//! Tunables. Defaults follow the build profile; every value can be
//! overridden from the environment before first use.

use std::env;
use std::sync::LazyLock;
use std::time::Duration;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(debug_assertions)] {
        // a few nanoseconds, so debug builds exercise the deferred path
        const DEFAULT_WAIT_TIMEOUT_NS: u64 = 3;
    } else {
        const DEFAULT_WAIT_TIMEOUT_NS: u64 = 3_000_000;
    }
}

const DEFAULT_RESET_THRESHOLD: usize = usize::MAX / 8;
const DEFAULT_PERIODIC_RESET: Duration = Duration::from_millis(50);

pub struct Options {
    /// How long `synchronize` spins before returning `Deferred`.
    pub wait_timeout: Duration,
    /// A required frontier reaching this value schedules an epoch reset for
    /// the next safepoint. Must stay well below half the counter's range or
    /// the wrap-aware order degenerates.
    pub epoch_reset_threshold: usize,
    /// Stress option: have the service thread force resets periodically
    /// regardless of the threshold.
    pub force_periodic_reset: bool,
    pub periodic_reset_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_nanos(DEFAULT_WAIT_TIMEOUT_NS),
            epoch_reset_threshold: DEFAULT_RESET_THRESHOLD,
            force_periodic_reset: false,
            periodic_reset_interval: DEFAULT_PERIODIC_RESET,
        }
    }
}

impl Options {
    pub fn from_env() -> Result<Self, String> {
        let mut options = Self::default();

        if let Ok(value) = env::var("REFINEKIT_WAIT_TIMEOUT_NS") {
            let ns: u64 = value
                .parse()
                .map_err(|_| format!("invalid REFINEKIT_WAIT_TIMEOUT_NS: {value}"))?;
            options.wait_timeout = Duration::from_nanos(ns);
        }
        if let Ok(value) = env::var("REFINEKIT_EPOCH_RESET_THRESHOLD") {
            options.epoch_reset_threshold = value
                .parse()
                .map_err(|_| format!("invalid REFINEKIT_EPOCH_RESET_THRESHOLD: {value}"))?;
        }
        if let Ok(value) = env::var("REFINEKIT_FORCE_PERIODIC_RESET") {
            options.force_periodic_reset = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(format!("invalid REFINEKIT_FORCE_PERIODIC_RESET: {value}")),
            };
        }
        if let Ok(value) = env::var("REFINEKIT_PERIODIC_RESET_MS") {
            let ms: u64 = value
                .parse()
                .map_err(|_| format!("invalid REFINEKIT_PERIODIC_RESET_MS: {value}"))?;
            options.periodic_reset_interval = Duration::from_millis(ms);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.epoch_reset_threshold == 0 || self.epoch_reset_threshold > usize::MAX / 4 {
            return Err(format!(
                "epoch reset threshold must stay well below half the counter range: {}",
                self.epoch_reset_threshold
            ));
        }
        Ok(())
    }
}

static OPTIONS: LazyLock<Options> = LazyLock::new(|| match Options::from_env() {
    Ok(options) => options,
    Err(message) => {
        log::warn!(target: "refinekit::options", "{message}; falling back to defaults");
        Options::default()
    }
});

pub fn options() -> &'static Options {
    &OPTIONS
}

#[cfg(test)]
mod tests {
    use super::Options;

    #[test]
    fn default_options_are_valid() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn oversized_reset_threshold_is_rejected() {
        let options = Options {
            epoch_reset_threshold: usize::MAX / 2,
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }
}

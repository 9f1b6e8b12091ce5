//! Engine configuration.
//!
//! Loaded from a camelCase JSON document. Every field has a default so an
//! empty object (or a missing file) yields a runnable configuration.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
	/// Maximum number of tasks running at once across all capabilities.
	pub concurrency: usize,
	/// Bound on the graceful drain performed at shutdown.
	pub shutdown_timeout_ms: u64,
	/// Idle hosts older than this are closed and recreated on next use.
	pub host_max_age_ms: Option<u64>,
	/// How often host recycling is evaluated when `host_max_age_ms` is set.
	pub maintenance_interval_ms: u64,
	/// Retry policy after repeated session acquisition failures.
	pub backoff: BackoffConfig,
	/// Whether manual surfaces close themselves once login succeeds.
	pub auto_close_surfaces: bool,
	/// Per-capability settings keyed by capability name.
	pub capabilities: HashMap<String, CapabilityConfig>,
}

impl Default for FleetConfig {
	fn default() -> Self {
		Self {
			concurrency: 4,
			shutdown_timeout_ms: 30_000,
			host_max_age_ms: None,
			maintenance_interval_ms: 60_000,
			backoff: BackoffConfig::default(),
			auto_close_surfaces: true,
			capabilities: HashMap::new(),
		}
	}
}

impl FleetConfig {
	/// Reads configuration from `path`, falling back to defaults when the file is absent.
	pub fn load(path: &Path) -> Result<Self> {
		let content = match fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(err) => return Err(err.into()),
		};
		let config: Self = serde_json::from_str(&content)
			.map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.concurrency == 0 {
			return Err(FleetError::Config("concurrency must be at least 1".into()));
		}
		if self.backoff.base_ms > self.backoff.max_ms {
			return Err(FleetError::Config("backoff.baseMs must not exceed backoff.maxMs".into()));
		}
		let mut names: Vec<&String> = self.capabilities.keys().collect();
		names.sort();
		let mut priorities: HashMap<u32, &str> = HashMap::new();
		for name in names {
			let capability = &self.capabilities[name];
			capability
				.validate()
				.map_err(|msg| FleetError::Config(format!("capability '{}': {}", name, msg)))?;
			if let Some(other) = priorities.insert(capability.priority, name) {
				return Err(FleetError::Config(format!(
					"capabilities '{}' and '{}' share priority {}",
					other, name, capability.priority
				)));
			}
		}
		Ok(())
	}

	/// Settings for each named loop, in order.
	///
	/// Capabilities without an entry get distinct priorities after every
	/// configured one, in the order given.
	pub fn loop_settings<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<CapabilityConfig> {
		let mut next = self
			.capabilities
			.values()
			.map(|c| c.priority.saturating_add(1))
			.max()
			.unwrap_or(CapabilityConfig::default().priority);
		names
			.into_iter()
			.map(|name| match self.capabilities.get(name) {
				Some(config) => config.clone(),
				None => {
					let config = CapabilityConfig {
						priority: next,
						..CapabilityConfig::default()
					};
					next = next.saturating_add(1);
					config
				}
			})
			.collect()
	}

	/// Returns the settings for `name`, or defaults when it is not configured.
	pub fn capability(&self, name: &str) -> CapabilityConfig {
		self.capabilities.get(name).cloned().unwrap_or_default()
	}

	pub fn shutdown_timeout(&self) -> Duration {
		Duration::from_millis(self.shutdown_timeout_ms)
	}

	pub fn host_max_age(&self) -> Option<Duration> {
		self.host_max_age_ms.map(Duration::from_millis)
	}
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
	pub base_ms: u64,
	pub max_ms: u64,
	/// Consecutive failures before the condition is reported at warn level.
	pub warn_after: u32,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base_ms: 30_000,
			max_ms: 30 * 60_000,
			warn_after: 3,
		}
	}
}

impl BackoffConfig {
	/// Delay before the next attempt after `failures` consecutive failures.
	pub fn delay(&self, failures: u32) -> Duration {
		if failures == 0 {
			return Duration::ZERO;
		}
		let factor = 1u64.checked_shl(failures.saturating_sub(1).min(32)).unwrap_or(u64::MAX);
		Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
	}
}

/// How a capability loop paces its work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
	/// Each account carries its own due time; the loop only submits due accounts.
	#[default]
	Timed,
	/// The loop cycles over every eligible account without per-account timing.
	Continuous,
}

/// Inclusive millisecond range sampled uniformly for jittered sleeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DurationRange {
	pub min_ms: u64,
	pub max_ms: u64,
}

impl DurationRange {
	pub const fn new(min_ms: u64, max_ms: u64) -> Self {
		Self { min_ms, max_ms }
	}

	pub fn sample(&self) -> Duration {
		if self.max_ms <= self.min_ms {
			return Duration::from_millis(self.min_ms);
		}
		Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
	}
}

/// Settings for one capability loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityConfig {
	/// Lower numbers win free queue slots first.
	pub priority: u32,
	pub batch_size: usize,
	pub pacing: Pacing,
	/// Next-due interval used when a task does not report one.
	pub default_interval_ms: u64,
	/// Sleep between eligibility passes.
	pub loop_sleep: DurationRange,
	/// Pause between consecutive batches within a pass.
	pub batch_pause: DurationRange,
	/// Hard bound on a single task body.
	pub task_timeout_ms: u64,
	/// Persist refreshed auth state after a clean run.
	pub persist_auth_on_success: bool,
}

impl Default for CapabilityConfig {
	fn default() -> Self {
		Self {
			priority: 10,
			batch_size: 5,
			pacing: Pacing::Timed,
			default_interval_ms: 15 * 60_000,
			loop_sleep: DurationRange::new(20_000, 40_000),
			batch_pause: DurationRange::new(1_000, 3_000),
			task_timeout_ms: 5 * 60_000,
			persist_auth_on_success: false,
		}
	}
}

impl CapabilityConfig {
	fn validate(&self) -> std::result::Result<(), String> {
		if self.batch_size == 0 {
			return Err("batchSize must be at least 1".into());
		}
		if self.task_timeout_ms == 0 {
			return Err("taskTimeoutMs must be positive".into());
		}
		for (field, range) in [("loopSleep", self.loop_sleep), ("batchPause", self.batch_pause)] {
			if range.min_ms > range.max_ms {
				return Err(format!("{}.minMs exceeds maxMs", field));
			}
		}
		Ok(())
	}

	pub fn default_interval(&self) -> Duration {
		Duration::from_millis(self.default_interval_ms)
	}

	pub fn task_timeout(&self) -> Duration {
		Duration::from_millis(self.task_timeout_ms)
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::TempDir;

	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let temp = TempDir::new().unwrap();
		let config = FleetConfig::load(&temp.path().join("fleet.json")).unwrap();
		assert_eq!(config.concurrency, 4);
		assert!(config.capabilities.is_empty());
	}

	#[test]
	fn partial_document_keeps_field_defaults() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("fleet.json");
		fs::write(
			&path,
			r#"{
  "concurrency": 2,
  "capabilities": {
    "inbox": { "priority": 1, "pacing": "continuous", "batchPause": { "minMs": 10, "maxMs": 20 } }
  }
}"#,
		)
		.unwrap();

		let config = FleetConfig::load(&path).unwrap();
		assert_eq!(config.concurrency, 2);
		let inbox = config.capability("inbox");
		assert_eq!(inbox.priority, 1);
		assert_eq!(inbox.pacing, Pacing::Continuous);
		assert_eq!(inbox.batch_size, 5);
		assert_eq!(inbox.batch_pause, DurationRange::new(10, 20));
		assert_eq!(config.capability("unknown").priority, 10);
	}

	#[test]
	fn zero_concurrency_is_rejected() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("fleet.json");
		fs::write(&path, r#"{"concurrency": 0}"#).unwrap();
		let err = FleetConfig::load(&path).unwrap_err();
		assert!(err.to_string().contains("concurrency"));
	}

	#[test]
	fn inverted_range_is_rejected() {
		let mut config = FleetConfig::default();
		config.capabilities.insert(
			"feed".into(),
			CapabilityConfig {
				loop_sleep: DurationRange::new(50, 10),
				..Default::default()
			},
		);
		let err = config.validate().unwrap_err();
		assert!(err.to_string().contains("capability 'feed'"));
	}

	#[test]
	fn shared_priorities_are_rejected() {
		let mut config = FleetConfig::default();
		config.capabilities.insert("feed".into(), CapabilityConfig::default());
		config.capabilities.insert("inbox".into(), CapabilityConfig::default());
		let err = config.validate().unwrap_err();
		assert!(err.to_string().contains("'feed' and 'inbox' share priority 10"), "{err}");
	}

	#[test]
	fn unconfigured_loops_get_distinct_priorities_after_configured_ones() {
		let mut config = FleetConfig::default();
		config.capabilities.insert(
			"inbox".into(),
			CapabilityConfig {
				priority: 3,
				..Default::default()
			},
		);

		let priorities: Vec<u32> = config
			.loop_settings(["feed", "inbox", "digest"])
			.iter()
			.map(|c| c.priority)
			.collect();
		assert_eq!(priorities, vec![4, 3, 5]);

		let bare = FleetConfig::default().loop_settings(["a", "b"]);
		assert_eq!(bare[0].priority, 10);
		assert_eq!(bare[1].priority, 11);
	}

	#[test]
	fn backoff_doubles_until_capped() {
		let backoff = BackoffConfig {
			base_ms: 100,
			max_ms: 1_000,
			warn_after: 3,
		};
		assert_eq!(backoff.delay(0), Duration::ZERO);
		assert_eq!(backoff.delay(1), Duration::from_millis(100));
		assert_eq!(backoff.delay(2), Duration::from_millis(200));
		assert_eq!(backoff.delay(4), Duration::from_millis(800));
		assert_eq!(backoff.delay(5), Duration::from_millis(1_000));
		assert_eq!(backoff.delay(200), Duration::from_millis(1_000));
	}

	#[test]
	fn sample_stays_within_range() {
		let range = DurationRange::new(5, 9);
		for _ in 0..50 {
			let sample = range.sample();
			assert!(sample >= Duration::from_millis(5) && sample <= Duration::from_millis(9));
		}
		assert_eq!(DurationRange::new(7, 7).sample(), Duration::from_millis(7));
	}
}

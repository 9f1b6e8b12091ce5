use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy)]
struct DueEntry {
	due_at: Instant,
	/// Consecutive acquisition failures; reset by any successful run.
	failures: u32,
}

/// When each (account, capability) pair may run next.
///
/// Absence of an entry means the pair is due immediately. The table lives in
/// memory only and is rebuilt as tasks complete after a restart.
#[derive(Debug, Default)]
pub struct DueTimeTable {
	entries: Mutex<HashMap<(String, String), DueEntry>>,
}

impl DueTimeTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_due(&self, account_id: &str, capability: &str) -> bool {
		self.entries
			.lock()
			.get(&key(account_id, capability))
			.is_none_or(|entry| entry.due_at <= Instant::now())
	}

	pub fn due_at(&self, account_id: &str, capability: &str) -> Option<Instant> {
		self.entries.lock().get(&key(account_id, capability)).map(|entry| entry.due_at)
	}

	/// Records a successful run; the pair is due again after `interval`.
	pub fn schedule(&self, account_id: &str, capability: &str, interval: Duration) {
		self.entries.lock().insert(
			key(account_id, capability),
			DueEntry {
				due_at: Instant::now() + interval,
				failures: 0,
			},
		);
	}

	pub fn clear(&self, account_id: &str, capability: &str) {
		self.entries.lock().remove(&key(account_id, capability));
	}

	/// Records an acquisition failure and pushes the pair back by the backoff delay.
	///
	/// Returns the consecutive failure count and the delay applied.
	pub fn record_failure(&self, account_id: &str, capability: &str, backoff: &BackoffConfig) -> (u32, Duration) {
		let mut entries = self.entries.lock();
		let entry = entries.entry(key(account_id, capability)).or_insert(DueEntry {
			due_at: Instant::now(),
			failures: 0,
		});
		entry.failures = entry.failures.saturating_add(1);
		let delay = backoff.delay(entry.failures);
		entry.due_at = Instant::now() + delay;
		(entry.failures, delay)
	}

	pub fn failures(&self, account_id: &str, capability: &str) -> u32 {
		self.entries
			.lock()
			.get(&key(account_id, capability))
			.map_or(0, |entry| entry.failures)
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

fn key(account_id: &str, capability: &str) -> (String, String) {
	(account_id.to_string(), capability.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn backoff() -> BackoffConfig {
		BackoffConfig {
			base_ms: 1_000,
			max_ms: 5_000,
			warn_after: 2,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_pairs_are_due() {
		let table = DueTimeTable::new();
		assert!(table.is_due("alice", "feed"));
		assert!(table.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn scheduled_pairs_become_due_after_interval() {
		let table = DueTimeTable::new();
		table.schedule("alice", "feed", Duration::from_secs(30));
		assert!(!table.is_due("alice", "feed"));
		assert!(table.is_due("alice", "inbox"));

		tokio::time::advance(Duration::from_secs(30)).await;
		assert!(table.is_due("alice", "feed"));
	}

	#[tokio::test(start_paused = true)]
	async fn failures_back_off_exponentially_and_reset_on_success() {
		let table = DueTimeTable::new();
		assert_eq!(table.record_failure("alice", "feed", &backoff()), (1, Duration::from_secs(1)));
		assert_eq!(table.record_failure("alice", "feed", &backoff()), (2, Duration::from_secs(2)));
		assert_eq!(table.record_failure("alice", "feed", &backoff()), (3, Duration::from_secs(4)));
		assert_eq!(table.record_failure("alice", "feed", &backoff()), (4, Duration::from_secs(5)));
		assert!(!table.is_due("alice", "feed"));

		table.schedule("alice", "feed", Duration::ZERO);
		assert_eq!(table.failures("alice", "feed"), 0);
		assert!(table.is_due("alice", "feed"));
	}
}

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_fleet_protocol::{AuthState, Cookie};
use serde_json::{Map, json};

use super::*;
use crate::account::CapabilitySettings;
use crate::capability::{CapabilityOutcome, ChallengeKind};
use crate::config::{BackoffConfig, DurationRange};
use crate::error::FleetError;
use crate::pool::SessionContext;
use crate::testing::{FakeDriver, FakeSurfaces, MemoryStore, SharedSurfaces, account};

const LOOP_SLEEP: Duration = Duration::from_secs(60);

#[derive(Clone)]
enum Step {
	Complete(Option<Duration>),
	Fail,
	Challenge,
	RejectLogin,
	Hang,
	RefreshCookie(&'static str),
	Report(&'static str),
}

/// Capability that follows a per-account script, completing by default.
struct Scripted {
	name: &'static str,
	steps: Mutex<HashMap<String, VecDeque<Step>>>,
	calls: Mutex<Vec<String>>,
}

impl Scripted {
	fn new(name: &'static str) -> Arc<Self> {
		Arc::new(Self {
			name,
			steps: Mutex::new(HashMap::new()),
			calls: Mutex::new(Vec::new()),
		})
	}

	fn script(&self, account_id: &str, steps: impl IntoIterator<Item = Step>) {
		self.steps.lock().entry(account_id.to_string()).or_default().extend(steps);
	}

	fn calls_for(&self, account_id: &str) -> usize {
		self.calls.lock().iter().filter(|id| *id == account_id).count()
	}
}

#[async_trait]
impl Capability for Scripted {
	fn name(&self) -> &str {
		self.name
	}

	async fn run(&self, session: &SessionContext, account: &Account, _settings: &CapabilitySettings) -> Result<CapabilityOutcome> {
		self.calls.lock().push(account.id.clone());
		let step = self
			.steps
			.lock()
			.get_mut(&account.id)
			.and_then(|steps| steps.pop_front())
			.unwrap_or(Step::Complete(None));

		match step {
			Step::Complete(next) => {
				let outcome = CapabilityOutcome::completed();
				Ok(match next {
					Some(interval) => outcome.due_in(interval),
					None => outcome,
				})
			}
			Step::Fail => Err(FleetError::Transient("navigation failed".into())),
			Step::Challenge => Ok(CapabilityOutcome::challenge(ChallengeKind::Captcha)),
			Step::RejectLogin => Err(FleetError::AuthenticationRejected(account.id.clone())),
			Step::Hang => {
				std::future::pending::<()>().await;
				Ok(CapabilityOutcome::completed())
			}
			Step::RefreshCookie(value) => {
				session
					.handle()
					.apply_auth_state(&AuthState {
						cookies: vec![Cookie {
							name: "sid".into(),
							value: value.into(),
							domain: Some(".example.com".into()),
							path: Some("/".into()),
							expires: -1.0,
							http_only: true,
							secure: true,
							same_site: None,
						}],
						origins: Vec::new(),
					})
					.await?;
				Ok(CapabilityOutcome::completed())
			}
			Step::Report(followers) => {
				let mut info = Map::new();
				info.insert("followers".into(), json!(followers));
				Ok(CapabilityOutcome::completed().with_info(info))
			}
		}
	}
}

struct Harness {
	orchestrator: Orchestrator,
	store: Arc<MemoryStore>,
	driver: Arc<FakeDriver>,
	surfaces: Arc<FakeSurfaces>,
}

fn capability_config(pacing: Pacing) -> CapabilityConfig {
	CapabilityConfig {
		priority: 1,
		batch_size: 2,
		pacing,
		default_interval_ms: 10 * 60_000,
		loop_sleep: DurationRange::new(60_000, 60_000),
		batch_pause: DurationRange::new(100, 100),
		task_timeout_ms: 5_000,
		persist_auth_on_success: false,
	}
}

fn harness(capability: Arc<Scripted>, config: CapabilityConfig, accounts: Vec<Account>) -> Harness {
	let mut fleet = FleetConfig {
		concurrency: 2,
		backoff: BackoffConfig {
			base_ms: 120_000,
			max_ms: 600_000,
			warn_after: 2,
		},
		..FleetConfig::default()
	};
	fleet.capabilities.insert(capability.name.to_string(), config);

	let store = MemoryStore::with_accounts(accounts);
	let driver = FakeDriver::new();
	let surfaces = FakeSurfaces::new();
	let pool = Arc::new(ResourcePool::new(driver.clone(), store.clone()));
	let gate = ChallengeGate::new(Arc::new(SharedSurfaces(Arc::clone(&surfaces))), store.clone(), true);
	let orchestrator = Orchestrator::new(fleet, TaskQueue::new(2), pool, gate, store.clone()).with_capability(capability);

	Harness {
		orchestrator,
		store,
		driver,
		surfaces,
	}
}

async fn advance(duration: Duration) {
	tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn unseen_accounts_run_on_the_first_pass() {
	let feed = Scripted::new("feed");
	let h = harness(
		feed.clone(),
		capability_config(Pacing::Timed),
		vec![account("alice", None, &["feed"]), account("bob", None, &["feed"])],
	);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;

	assert_eq!(feed.calls_for("alice"), 1);
	assert_eq!(feed.calls_for("bob"), 1);
	assert_eq!(h.orchestrator.due_times().len(), 2);
	assert_eq!(h.driver.open_contexts(), 0);
}

#[tokio::test(start_paused = true)]
async fn ineligible_accounts_are_never_submitted() {
	let feed = Scripted::new("feed");
	let h = harness(
		feed.clone(),
		capability_config(Pacing::Timed),
		vec![
			account("alice", None, &["feed"]),
			account("bob", None, &["inbox"]),
			account("carol", None, &["feed"]),
		],
	);
	h.store.set_active("carol", false);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;

	assert_eq!(*feed.calls.lock(), vec!["alice".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn reported_interval_controls_the_next_run() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::Complete(Some(Duration::from_secs(300)))]);
	let h = harness(feed.clone(), capability_config(Pacing::Timed), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	assert_eq!(feed.calls_for("alice"), 1);

	// Passes at 60s..240s find alice not yet due.
	advance(Duration::from_secs(250)).await;
	assert_eq!(feed.calls_for("alice"), 1);

	// The pass at 300s picks her up; no interval reported, so the default applies.
	advance(Duration::from_secs(60)).await;
	assert_eq!(feed.calls_for("alice"), 2);
	assert!(!h.orchestrator.due_times().is_due("alice", "feed"));

	advance(Duration::from_secs(9 * 60)).await;
	assert_eq!(feed.calls_for("alice"), 2);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_stop_the_batch_and_retries_next_cycle() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::Fail]);
	let h = harness(
		feed.clone(),
		capability_config(Pacing::Timed),
		vec![account("alice", None, &["feed"]), account("bob", None, &["feed"])],
	);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	assert_eq!(feed.calls_for("alice"), 1);
	assert_eq!(feed.calls_for("bob"), 1);
	assert!(h.orchestrator.due_times().is_due("alice", "feed"));
	assert_eq!(h.orchestrator.queue().stats().failed, 1);

	advance(LOOP_SLEEP).await;
	assert_eq!(feed.calls_for("alice"), 2);
	assert_eq!(feed.calls_for("bob"), 1);
}

#[tokio::test(start_paused = true)]
async fn challenges_suspend_until_the_surface_closes() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::Challenge]);
	let h = harness(feed.clone(), capability_config(Pacing::Continuous), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	assert!(h.orchestrator.gate().is_suspended("alice"));
	assert_eq!(h.surfaces.open_count(), 1);
	assert_eq!(h.store.auth_writes.lock().clone(), vec![("alice".to_string(), None)]);

	advance(LOOP_SLEEP * 3).await;
	assert_eq!(feed.calls_for("alice"), 1);

	assert!(h.surfaces.resolve("alice", Default::default()));
	advance(LOOP_SLEEP).await;
	assert!(!h.orchestrator.gate().is_suspended("alice"));
	assert!(feed.calls_for("alice") >= 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_login_escalates_once() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::RejectLogin]);
	let h = harness(feed.clone(), capability_config(Pacing::Timed), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(LOOP_SLEEP * 2).await;

	assert_eq!(feed.calls_for("alice"), 1);
	assert_eq!(h.surfaces.open_count(), 1);
	assert_eq!(h.orchestrator.snapshot().suspended, vec!["alice".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn acquisition_failures_back_off() {
	let feed = Scripted::new("feed");
	let h = harness(feed.clone(), capability_config(Pacing::Timed), vec![account("alice", None, &["feed"])]);
	h.driver.fail_launch.store(true, Ordering::SeqCst);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	assert_eq!(h.orchestrator.due_times().failures("alice", "feed"), 1);

	// Backoff is 120s: the 60s pass skips alice, the 120s pass retries.
	advance(LOOP_SLEEP).await;
	assert_eq!(h.driver.launches.load(Ordering::SeqCst), 1);
	advance(LOOP_SLEEP).await;
	assert_eq!(h.driver.launches.load(Ordering::SeqCst), 2);
	assert_eq!(h.orchestrator.due_times().failures("alice", "feed"), 2);

	h.driver.fail_launch.store(false, Ordering::SeqCst);
	advance(LOOP_SLEEP * 4).await;
	assert_eq!(feed.calls_for("alice"), 1);
	assert_eq!(h.orchestrator.due_times().failures("alice", "feed"), 0);
}

#[tokio::test(start_paused = true)]
async fn enumeration_failure_skips_only_that_cycle() {
	let feed = Scripted::new("feed");
	let h = harness(feed.clone(), capability_config(Pacing::Timed), vec![account("alice", None, &["feed"])]);
	h.store.fail_listing.store(true, Ordering::SeqCst);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	assert_eq!(feed.calls_for("alice"), 0);

	h.store.fail_listing.store(false, Ordering::SeqCst);
	advance(LOOP_SLEEP).await;
	assert_eq!(feed.calls_for("alice"), 1);
}

#[tokio::test(start_paused = true)]
async fn continuous_pacing_cycles_without_due_times() {
	let feed = Scripted::new("feed");
	let h = harness(feed.clone(), capability_config(Pacing::Continuous), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(Duration::from_millis(350)).await;

	assert!(feed.calls_for("alice") >= 3);
	assert_eq!(h.orchestrator.due_times().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn batches_are_paced_and_awaited() {
	let feed = Scripted::new("feed");
	let h = harness(
		feed.clone(),
		capability_config(Pacing::Timed),
		vec![
			account("a", None, &["feed"]),
			account("b", None, &["feed"]),
			account("c", None, &["feed"]),
		],
	);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	let mut first_batch = feed.calls.lock().clone();
	first_batch.sort();
	assert_eq!(first_batch, vec!["a".to_string(), "b".to_string()]);

	advance(Duration::from_millis(100)).await;
	assert_eq!(feed.calls_for("c"), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_bodies_time_out_and_release_their_context() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::Hang]);
	let h = harness(feed.clone(), capability_config(Pacing::Timed), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(Duration::from_secs(6)).await;

	assert_eq!(h.orchestrator.queue().stats().failed, 1);
	assert_eq!(h.orchestrator.queue().stats().running, 0);
	assert_eq!(h.driver.open_contexts(), 0);
	assert_eq!(h.orchestrator.pool().stats().active_context_count, 0);
}

#[tokio::test(start_paused = true)]
async fn successful_runs_persist_auth_and_info_when_asked() {
	let feed = Scripted::new("feed");
	feed.script("alice", [Step::RefreshCookie("fresh")]);
	feed.script("bob", [Step::Report("1200")]);
	let mut config = capability_config(Pacing::Timed);
	config.persist_auth_on_success = true;
	let h = harness(
		feed.clone(),
		config,
		vec![account("alice", None, &["feed"]), account("bob", None, &["feed"])],
	);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;

	let alice = h.store.account("alice").unwrap();
	assert_eq!(alice.auth_state.unwrap().cookies[0].value, "fresh");
	let bob = h.store.account("bob").unwrap();
	assert_eq!(bob.info.get("followers"), Some(&json!("1200")));
}

#[tokio::test(start_paused = true)]
async fn stop_ends_every_loop() {
	let feed = Scripted::new("feed");
	let h = harness(feed.clone(), capability_config(Pacing::Continuous), vec![account("alice", None, &["feed"])]);

	h.orchestrator.start();
	advance(Duration::from_millis(10)).await;
	h.orchestrator.stop();
	assert!(!h.orchestrator.is_running());

	for handle in h.orchestrator.take_loops() {
		handle.await.unwrap();
	}
	let calls = feed.calls_for("alice");
	advance(LOOP_SLEEP).await;
	assert_eq!(feed.calls_for("alice"), calls);
}

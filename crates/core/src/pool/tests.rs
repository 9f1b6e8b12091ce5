use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pw_fleet_protocol::{AuthState, Cookie};

use super::*;
use crate::testing::{FakeContext, FakeDriver, MemoryStore, account};

fn cookie(name: &str, value: &str) -> Cookie {
	Cookie {
		name: name.into(),
		value: value.into(),
		domain: Some(".example.com".into()),
		path: Some("/".into()),
		expires: -1.0,
		http_only: true,
		secure: true,
		same_site: None,
	}
}

fn pool_with(accounts: Vec<crate::Account>) -> (ResourcePool, Arc<FakeDriver>, Arc<MemoryStore>) {
	let driver = FakeDriver::new();
	let store = MemoryStore::with_accounts(accounts);
	let pool = ResourcePool::new(driver.clone(), store.clone());
	(pool, driver, store)
}

#[tokio::test(start_paused = true)]
async fn simultaneous_first_use_creates_one_host() {
	let (pool, driver, _) = pool_with(vec![
		account("alice", Some("10.0.0.1:8080"), &[]),
		account("bob", Some("10.0.0.1:8080"), &[]),
	]);
	*driver.launch_delay.lock() = Some(Duration::from_millis(50));

	let (a, b) = tokio::join!(pool.acquire_context("alice"), pool.acquire_context("bob"));
	let (a, b) = (a.unwrap(), b.unwrap());

	assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
	assert!(Arc::ptr_eq(&a.host, &b.host));
	assert_eq!(a.resource_key, b.resource_key);
	assert_eq!(
		pool.stats(),
		PoolStats {
			host_count: 1,
			active_context_count: 2
		}
	);
}

#[tokio::test]
async fn distinct_egress_identities_get_distinct_hosts() {
	let (pool, driver, _) = pool_with(vec![
		account("alice", Some("10.0.0.1:8080"), &[]),
		account("bob", Some("10.0.0.2:8080"), &[]),
		account("carol", None, &[]),
	]);

	let leases = [
		pool.acquire_context("alice").await.unwrap(),
		pool.acquire_context("bob").await.unwrap(),
		pool.acquire_context("carol").await.unwrap(),
	];

	assert_eq!(driver.launches.load(Ordering::SeqCst), 3);
	assert_eq!(pool.stats().host_count, 3);
	assert!(leases[2].resource_key.is_direct());
}

#[tokio::test]
async fn contexts_under_one_host_are_isolated() {
	let mut alice = account("alice", None, &[]);
	alice.auth_state = Some(AuthState {
		cookies: vec![cookie("sid", "alice-token")],
		origins: Vec::new(),
	});
	let (pool, _, _) = pool_with(vec![alice, account("bob", None, &[])]);

	let a = pool.acquire_context("alice").await.unwrap();
	let b = pool.acquire_context("bob").await.unwrap();
	assert!(Arc::ptr_eq(&a.host, &b.host));

	let alice_state = a.context.handle().auth_state().await.unwrap();
	let bob_state = b.context.handle().auth_state().await.unwrap();
	assert_eq!(alice_state.cookies[0].value, "alice-token");
	assert!(bob_state.cookies.is_empty());

	b.context
		.handle()
		.apply_auth_state(&AuthState {
			cookies: vec![cookie("sid", "bob-token")],
			origins: Vec::new(),
		})
		.await
		.unwrap();
	assert_eq!(a.context.handle().auth_state().await.unwrap().cookies[0].value, "alice-token");
	assert_ne!(a.context.handle().id(), b.context.handle().id());
	assert!(a.context.downcast::<FakeContext>().is_some());
}

#[tokio::test]
async fn release_keeps_host_alive() {
	let (pool, driver, _) = pool_with(vec![account("alice", None, &[])]);

	let lease = pool.acquire_context("alice").await.unwrap();
	assert_eq!(pool.stats().active_context_count, 1);

	pool.release_context(lease.context, &lease.resource_key).await;
	assert_eq!(driver.open_contexts(), 0);
	assert_eq!(driver.open_hosts(), 1);
	assert_eq!(
		pool.stats(),
		PoolStats {
			host_count: 1,
			active_context_count: 0
		}
	);

	pool.acquire_context("alice").await.unwrap();
	assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_account_is_reported() {
	let (pool, _, _) = pool_with(Vec::new());
	let err = pool.acquire_context("ghost").await.err().expect("unknown account must fail");
	assert!(matches!(err, FleetError::AccountNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn failed_launch_is_retried_by_the_next_caller() {
	let (pool, driver, _) = pool_with(vec![account("alice", Some("10.0.0.9:3128"), &[])]);
	driver.fail_launch.store(true, Ordering::SeqCst);

	let err = pool.acquire_context("alice").await.err().expect("launch failure must surface");
	assert!(matches!(err, FleetError::ResourceAcquisition { ref key, .. } if key == "proxy:10.0.0.9:3128"));
	assert_eq!(pool.stats().host_count, 0);

	driver.fail_launch.store(false, Ordering::SeqCst);
	pool.acquire_context("alice").await.unwrap();
	assert_eq!(driver.launches.load(Ordering::SeqCst), 2);
	assert_eq!(pool.stats().host_count, 1);
}

#[tokio::test]
async fn persist_auth_state_writes_through_store() {
	let (pool, _, store) = pool_with(vec![account("alice", None, &[])]);
	let lease = pool.acquire_context("alice").await.unwrap();
	lease
		.context
		.handle()
		.apply_auth_state(&AuthState {
			cookies: vec![cookie("sid", "fresh")],
			origins: Vec::new(),
		})
		.await
		.unwrap();

	pool.persist_auth_state(&lease.context, "alice").await.unwrap();

	let stored = store.account("alice").unwrap().auth_state.unwrap();
	assert_eq!(stored.cookies[0].value, "fresh");
}

#[tokio::test]
async fn shutdown_closes_contexts_and_hosts_and_refuses_new_work() {
	let (pool, driver, _) = pool_with(vec![account("alice", None, &[]), account("bob", Some("10.0.0.1:8080"), &[])]);
	let _a = pool.acquire_context("alice").await.unwrap();
	let _b = pool.acquire_context("bob").await.unwrap();

	assert_eq!(pool.shutdown_all().await, 2);
	assert_eq!(driver.open_contexts(), 0);
	assert_eq!(driver.open_hosts(), 0);
	assert_eq!(pool.stats(), PoolStats::default());
	assert!(matches!(pool.acquire_context("alice").await, Err(FleetError::ShuttingDown)));
}

#[tokio::test(start_paused = true)]
async fn recycle_closes_only_idle_expired_hosts() {
	let (pool, driver, _) = pool_with(vec![account("alice", None, &[]), account("bob", Some("10.0.0.1:8080"), &[])]);
	let idle = pool.acquire_context("alice").await.unwrap();
	pool.release_context(idle.context, &idle.resource_key).await;
	let _busy = pool.acquire_context("bob").await.unwrap();

	assert_eq!(pool.recycle_expired(Duration::from_secs(60)).await, 0);
	tokio::time::advance(Duration::from_secs(61)).await;
	assert_eq!(pool.recycle_expired(Duration::from_secs(60)).await, 1);
	assert_eq!(pool.stats().host_count, 1);
	assert_eq!(driver.open_hosts(), 1);

	pool.acquire_context("alice").await.unwrap();
	assert_eq!(driver.launches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn host_finishing_launch_after_shutdown_is_closed() {
	let (pool, driver, _) = pool_with(vec![account("alice", None, &[])]);
	*driver.launch_delay.lock() = Some(Duration::from_millis(100));
	let pool = Arc::new(pool);

	let acquiring = tokio::spawn({
		let pool = Arc::clone(&pool);
		async move { pool.acquire_context("alice").await.map(|lease| lease.resource_key) }
	});
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(pool.shutdown_all().await, 0);
	let result = acquiring.await.unwrap();

	assert!(matches!(result, Err(FleetError::ShuttingDown)));
	assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
	assert_eq!(driver.open_hosts(), 0);
	assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test(start_paused = true)]
async fn recycle_skips_host_with_context_being_created() {
	let (pool, driver, _) = pool_with(vec![account("alice", None, &[])]);
	*driver.context_delay.lock() = Some(Duration::from_millis(100));
	let pool = Arc::new(pool);

	let acquiring = tokio::spawn({
		let pool = Arc::clone(&pool);
		async move { pool.acquire_context("alice").await.map(|lease| lease.context.id()) }
	});
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(pool.recycle_expired(Duration::ZERO).await, 0);
	assert!(acquiring.await.unwrap().is_ok());
	assert_eq!(driver.open_hosts(), 1);
	assert_eq!(pool.stats().active_context_count, 1);
	assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
}

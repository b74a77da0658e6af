use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::pipeline::Pipeline;



/// Table of running pipelines, at most one per key.
///
/// Every mutation happens under one lock, so a lookup never observes a half-finished launch.
pub struct SessionRegistry<K> {
	sessions: Mutex<HashMap<K, Arc<Pipeline<K>>>>,
}

impl<K> SessionRegistry<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
	pub fn new() -> Self {
		Self {
			sessions: Mutex::new(HashMap::new()),
		}
	}

	/// Registers `pipeline` under `key` unless the key is taken. Returns whether it was inserted.
	///
	/// The pipeline must already be running. The controllers use `get_or_launch` instead, which
	/// also covers the launch.
	pub async fn insert_if_absent(&self, key: K, pipeline: Arc<Pipeline<K>>) -> bool {
		let mut sessions = self.sessions.lock().await;
		if sessions.contains_key(&key) {
			return false;
		}
		sessions.insert(key, pipeline);
		true
	}

	pub async fn lookup(&self, key: &K) -> Option<Arc<Pipeline<K>>> {
		self.sessions.lock().await.get(key).cloned()
	}

	pub async fn remove(&self, key: &K) -> Option<Arc<Pipeline<K>>> {
		self.sessions.lock().await.remove(key)
	}

	/// Removes the entry for `key` only if it is the pipeline with the given id.
	pub async fn remove_if(&self, key: &K, pipeline_id: u64) -> bool {
		let mut sessions = self.sessions.lock().await;
		match sessions.get(key) {
			Some(pipeline) if pipeline.id() == pipeline_id => {
				sessions.remove(key);
				true
			},
			_ => false,
		}
	}

	/// Returns the pipeline registered under `key`, or runs `launch` and registers its result.
	///
	/// The lookup, `launch` and the insert form one critical section: concurrent callers for
	/// the same key wait here, then observe the pipeline the first caller registered. The
	/// returned flag is true when this call launched the pipeline.
	pub async fn get_or_launch<F, Fut, E>(&self, key: K, launch: F) -> Result<(Arc<Pipeline<K>>, bool), E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<Arc<Pipeline<K>>, E>>,
	{
		let mut sessions = self.sessions.lock().await;
		if let Some(existing) = sessions.get(&key) {
			return Ok((Arc::clone(existing), false));
		}
		let pipeline = launch().await?;
		sessions.insert(key, Arc::clone(&pipeline));
		Ok((pipeline, true))
	}

	pub async fn snapshot(&self) -> Vec<Arc<Pipeline<K>>> {
		self.sessions.lock().await.values().cloned().collect()
	}

	/// Empties the registry, handing back every pipeline it owned.
	pub async fn drain(&self) -> Vec<Arc<Pipeline<K>>> {
		self.sessions.lock().await.drain().map(|(_, pipeline)| pipeline).collect()
	}

	pub async fn len(&self) -> usize {
		self.sessions.lock().await.len()
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::SessionError;
	use crate::testing::{live_job, Behavior, FakeBackend};

	// Silent fakes never touch the filesystem
	fn fake() -> FakeBackend {
		FakeBackend::with_behavior(Behavior::Silent)
	}

	fn start(backend: &FakeBackend, key: &str) -> Arc<Pipeline<String>> {
		Pipeline::start(key.to_string(), &live_job(key), backend).unwrap()
	}

	#[tokio::test]
	async fn insert_if_absent_keeps_first_entry() {
		let backend = fake();
		let registry = SessionRegistry::new();
		let first = start(&backend, "1-sub");
		let second = start(&backend, "1-sub");

		assert!(registry.insert_if_absent("1-sub".to_string(), Arc::clone(&first)).await);
		assert!(!registry.insert_if_absent("1-sub".to_string(), second).await);
		assert_eq!(registry.lookup(&"1-sub".to_string()).await.unwrap().id(), first.id());
		assert_eq!(registry.len().await, 1);
	}

	#[tokio::test]
	async fn remove_if_ignores_replaced_pipelines() {
		let backend = fake();
		let registry = SessionRegistry::new();
		let old = start(&backend, "2");
		let new = start(&backend, "2");
		registry.insert_if_absent("2".to_string(), Arc::clone(&new)).await;

		assert!(!registry.remove_if(&"2".to_string(), old.id()).await);
		assert!(registry.lookup(&"2".to_string()).await.is_some());
		assert!(registry.remove_if(&"2".to_string(), new.id()).await);
		assert!(registry.lookup(&"2".to_string()).await.is_none());
	}

	#[tokio::test]
	async fn get_or_launch_runs_launch_once() {
		let backend = fake();
		let registry = SessionRegistry::new();
		let key = "1-main".to_string();

		let (first, launched) = registry
			.get_or_launch(key.clone(), || async { Ok::<_, SessionError>(start(&backend, "1-main")) })
			.await
			.unwrap();
		assert!(launched);
		let (again, launched) = registry
			.get_or_launch(key.clone(), || async { Ok::<_, SessionError>(start(&backend, "1-main")) })
			.await
			.unwrap();
		assert!(!launched);
		assert_eq!(first.id(), again.id());
		assert_eq!(backend.spawn_count(), 1);
	}

	#[tokio::test]
	async fn failed_launch_registers_nothing() {
		let registry: SessionRegistry<String> = SessionRegistry::new();
		let result = registry
			.get_or_launch("1-sub".to_string(), || async {
				Err(SessionError::Launch { key: "1-sub".to_string(), reason: "no encoder".to_string() })
			})
			.await;
		assert!(result.is_err());
		assert_eq!(registry.len().await, 0);
	}

	#[tokio::test]
	async fn exited_pipeline_deregisters_itself() {
		let backend = fake();
		let registry = Arc::new(SessionRegistry::new());
		let pipeline = start(&backend, "1-sub");
		registry.insert_if_absent("1-sub".to_string(), Arc::clone(&pipeline)).await;
		pipeline.supervise(Arc::clone(&registry));

		backend.process(0).crash(Some(1));
		pipeline.exited().await;
		for _ in 0..50 {
			if registry.len().await == 0 {
				break;
			}
			tokio::task::yield_now().await;
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		}
		assert_eq!(registry.len().await, 0);
	}

	#[tokio::test]
	async fn drain_empties_registry() {
		let backend = fake();
		let registry = SessionRegistry::new();
		registry.insert_if_absent("a".to_string(), start(&backend, "a")).await;
		registry.insert_if_absent("b".to_string(), start(&backend, "b")).await;

		assert_eq!(registry.snapshot().await.len(), 2);
		assert_eq!(registry.drain().await.len(), 2);
		assert_eq!(registry.len().await, 0);
	}
}

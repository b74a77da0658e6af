use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::watch;
use url::Url;

use crate::common::Quality;
use crate::error::{SessionError, SessionResult};
use crate::registry::SessionRegistry;



static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// What an encoder should produce from its source.
#[derive(Clone)]
#[derive(Debug)]
pub enum EncodeProfile {
	/// Segmented low-latency output: one playlist plus a rolling window of segments.
	Live {
		quality: Quality,
		segment_pattern: PathBuf,
		segment_seconds: u32,
		playlist_size: u32,
		read_timeout: Duration,
	},
	/// One finalized container file, always from the main feed.
	Recording,
}

#[derive(Clone)]
#[derive(Debug)]
pub struct EncodeJob {
	pub label: String,
	pub source: Url,
	pub output: PathBuf,
	pub profile: EncodeProfile,
}

#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessExit {
	Success,
	Failed(Option<i32>),
	/// The exit status could not be collected.
	Lost(String),
}

impl fmt::Display for ProcessExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProcessExit::Success => f.write_str("exited cleanly"),
			ProcessExit::Failed(Some(code)) => write!(f, "exited with code {}", code),
			ProcessExit::Failed(None) => f.write_str("terminated by signal"),
			ProcessExit::Lost(reason) => write!(f, "lost ({})", reason),
		}
	}
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
pub enum StopRequest {
	/// Quit command written to the control channel.
	Quit,
	/// Control channel unavailable, interrupt signal sent.
	Interrupt,
	AlreadyExited,
}

/// A running encoder process. The only operations the controllers may perform on it.
#[rocket::async_trait]
pub trait EncoderProcess: Send + Sync {
	fn pid(&self) -> Option<u32>;

	async fn request_graceful_stop(&self) -> io::Result<StopRequest>;

	/// Becomes `Some` once the process has exited, for whatever reason.
	fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>>;

	fn is_alive(&self) -> bool {
		self.exit_watch().borrow().is_none()
	}
}

/// Launches encoder processes. Swappable so the controllers never depend on how encoders run.
pub trait EncoderBackend: Send + Sync {
	fn spawn(&self, job: &EncodeJob) -> io::Result<Box<dyn EncoderProcess>>;
}

/// One running encoder plus the artifact it owns, registered under `key`.
pub struct Pipeline<K> {
	id: u64,
	key: K,
	started_at: DateTime<Utc>,
	started: Instant,
	output_path: PathBuf,
	process: Box<dyn EncoderProcess>,
}

impl<K> Pipeline<K>
where
	K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
	pub fn start(key: K, job: &EncodeJob, backend: &dyn EncoderBackend) -> SessionResult<Arc<Self>> {
		let process = backend.spawn(job).map_err(|err| {
			error!("Failed to spawn encoder for {}: {}", key, err);
			SessionError::Launch { key: key.to_string(), reason: err.to_string() }
		})?;

		let pipeline = Self {
			id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
			key,
			started_at: Utc::now(),
			started: Instant::now(),
			output_path: job.output.clone(),
			process,
		};
		info!(
			"Started pipeline {} for {} (pid {:?}) writing {}",
			pipeline.id,
			pipeline.key,
			pipeline.process.pid(),
			pipeline.output_path.display()
		);
		Ok(Arc::new(pipeline))
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn key(&self) -> &K {
		&self.key
	}

	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	pub fn elapsed(&self) -> Duration {
		self.started.elapsed()
	}

	pub fn output_path(&self) -> &Path {
		&self.output_path
	}

	pub fn is_alive(&self) -> bool {
		self.process.is_alive()
	}

	pub async fn request_graceful_stop(&self) -> io::Result<StopRequest> {
		let request = self.process.request_graceful_stop().await?;
		info!("Requested graceful stop of pipeline {} for {}: {:?}", self.id, self.key, request);
		Ok(request)
	}

	/// Resolves once the process has exited.
	pub async fn exited(&self) -> ProcessExit {
		let mut exit = self.process.exit_watch();
		let outcome = match exit.wait_for(Option::is_some).await {
			Ok(outcome) => outcome.clone(),
			Err(_) => None,
		};
		outcome.unwrap_or_else(|| ProcessExit::Lost("exit notifier dropped".to_string()))
	}

	/// Deregisters this pipeline from `registry` when its process exits.
	///
	/// Only this exact pipeline is removed: if the key has since been taken over by a newer
	/// pipeline, that one stays registered.
	pub fn supervise(self: &Arc<Self>, registry: Arc<SessionRegistry<K>>) {
		let pipeline = Arc::clone(self);
		tokio::spawn(async move {
			let outcome = pipeline.exited().await;
			match outcome {
				ProcessExit::Success => info!("Pipeline {} for {} {}", pipeline.id, pipeline.key, outcome),
				_ => warn!("Pipeline {} for {} {}", pipeline.id, pipeline.key, outcome),
			}
			if registry.remove_if(&pipeline.key, pipeline.id).await {
				info!("Deregistered pipeline {} for {}", pipeline.id, pipeline.key);
			}
		});
	}
}

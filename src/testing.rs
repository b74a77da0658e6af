//! In-memory stand-in for ffmpeg used by the unit tests.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use url::Url;

use crate::common::Quality;
use crate::pipeline::{EncodeJob, EncodeProfile, EncoderBackend, EncoderProcess, ProcessExit, StopRequest};



pub fn live_job(label: &str) -> EncodeJob {
	EncodeJob {
		label: label.to_string(),
		source: Url::parse("rtsp://127.0.0.1:8554/test").unwrap(),
		output: std::env::temp_dir().join(format!("fake-{}.m3u8", label)),
		profile: EncodeProfile::Live {
			quality: Quality::Sub,
			segment_pattern: PathBuf::from("sub_%03d.ts"),
			segment_seconds: 2,
			playlist_size: 3,
			read_timeout: Duration::from_secs(10),
		},
	}
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
pub enum Behavior {
	/// Writes the playlist on spawn; recordings gain content when stopped.
	Normal,
	/// Runs but never produces a playlist.
	Silent,
	/// Exits with an error right after spawning.
	ExitImmediately,
	/// Spawning itself fails.
	SpawnFails,
}

pub struct FakeProcessState {
	pub job: EncodeJob,
	exit: watch::Sender<Option<ProcessExit>>,
	stop_requests: AtomicUsize,
	finalize_delay: Duration,
}

impl FakeProcessState {
	pub fn crash(&self, code: Option<i32>) {
		self.exit.send_replace(Some(ProcessExit::Failed(code)));
	}

	pub fn stop_requests(&self) -> usize {
		self.stop_requests.load(Ordering::SeqCst)
	}

	pub fn is_running(&self) -> bool {
		self.exit.borrow().is_none()
	}
}

struct FakeProcess {
	state: Arc<FakeProcessState>,
}

#[rocket::async_trait]
impl EncoderProcess for FakeProcess {
	fn pid(&self) -> Option<u32> {
		None
	}

	async fn request_graceful_stop(&self) -> io::Result<StopRequest> {
		self.state.stop_requests.fetch_add(1, Ordering::SeqCst);
		if !self.state.is_running() {
			return Ok(StopRequest::AlreadyExited);
		}
		if let EncodeProfile::Recording = self.state.job.profile {
			let mut file = std::fs::OpenOptions::new().append(true).create(true).open(&self.state.job.output)?;
			file.write_all(b"\0\0\0\x18ftypisom....moov")?;
		}
		if self.state.finalize_delay.is_zero() {
			self.state.exit.send_replace(Some(ProcessExit::Success));
		} else {
			let state = Arc::clone(&self.state);
			tokio::spawn(async move {
				tokio::time::sleep(state.finalize_delay).await;
				state.exit.send_replace(Some(ProcessExit::Success));
			});
		}
		Ok(StopRequest::Quit)
	}

	fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
		self.state.exit.subscribe()
	}
}

pub struct FakeBackend {
	behavior: Mutex<Behavior>,
	spawn_delay: Duration,
	finalize_delay: Duration,
	processes: Mutex<Vec<Arc<FakeProcessState>>>,
}

impl FakeBackend {
	pub fn new() -> Self {
		Self::with_behavior(Behavior::Normal)
	}

	pub fn with_behavior(behavior: Behavior) -> Self {
		Self {
			behavior: Mutex::new(behavior),
			spawn_delay: Duration::ZERO,
			finalize_delay: Duration::ZERO,
			processes: Mutex::new(Vec::new()),
		}
	}

	/// Makes every spawn block briefly, widening the window for launch races.
	pub fn slow(mut self, delay: Duration) -> Self {
		self.spawn_delay = delay;
		self
	}

	/// Keeps stopped processes running for `delay` after the stop request, like a slow index rewrite.
	pub fn finalize_after(mut self, delay: Duration) -> Self {
		self.finalize_delay = delay;
		self
	}

	pub fn set_behavior(&self, behavior: Behavior) {
		*self.behavior.lock().unwrap() = behavior;
	}

	pub fn spawn_count(&self) -> usize {
		self.processes.lock().unwrap().len()
	}

	pub fn process(&self, index: usize) -> Arc<FakeProcessState> {
		Arc::clone(&self.processes.lock().unwrap()[index])
	}

	pub fn running_writers(&self, output: &std::path::Path) -> usize {
		self.processes.lock().unwrap()
			.iter()
			.filter(|process| process.job.output == output && process.is_running())
			.count()
	}
}

impl EncoderBackend for FakeBackend {
	fn spawn(&self, job: &EncodeJob) -> io::Result<Box<dyn EncoderProcess>> {
		let behavior = *self.behavior.lock().unwrap();
		if behavior == Behavior::SpawnFails {
			return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg: not found"));
		}
		if !self.spawn_delay.is_zero() {
			std::thread::sleep(self.spawn_delay);
		}

		match (&job.profile, behavior) {
			(EncodeProfile::Live { .. }, Behavior::Normal) => {
				std::fs::write(&job.output, "#EXTM3U\n#EXT-X-VERSION:3\n")?;
			},
			(EncodeProfile::Recording, Behavior::Normal | Behavior::Silent) => {
				std::fs::File::create(&job.output)?;
			},
			_ => {},
		}

		let (exit, _) = watch::channel(None);
		let state = Arc::new(FakeProcessState {
			job: job.clone(),
			exit,
			stop_requests: AtomicUsize::new(0),
			finalize_delay: self.finalize_delay,
		});
		if behavior == Behavior::ExitImmediately {
			state.crash(Some(1));
		}
		self.processes.lock().unwrap().push(Arc::clone(&state));
		Ok(Box::new(FakeProcess { state }))
	}
}

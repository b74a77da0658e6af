use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info, warn};
use tokio::time::{sleep, timeout, Instant};

use crate::common::{is_valid_camera_id, CameraDirectory, CameraId, Quality};
use crate::config::RecordingSettings;
use crate::error::{SessionError, SessionResult};
use crate::pipeline::{EncodeJob, EncodeProfile, EncoderBackend, Pipeline};
use crate::registry::SessionRegistry;



/// A finished recording, handed back once when it is stopped.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
	pub camera_id: CameraId,
	pub filename: String,
	/// Seconds between launch and the stop request.
	pub duration: f64,
	pub completed_at: DateTime<Utc>,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecording {
	pub filename: String,
	pub size: u64,
	pub modified: Option<DateTime<Utc>>,
}

pub struct RecordingController {
	cameras: Arc<CameraDirectory>,
	backend: Arc<dyn EncoderBackend>,
	registry: Arc<SessionRegistry<CameraId>>,
	recording_dir: PathBuf,
	settings: RecordingSettings,
}

impl RecordingController {
	pub fn new(
		cameras: Arc<CameraDirectory>,
		backend: Arc<dyn EncoderBackend>,
		recording_dir: PathBuf,
		settings: RecordingSettings,
	) -> Self {
		Self {
			cameras,
			backend,
			registry: Arc::new(SessionRegistry::new()),
			recording_dir,
			settings,
		}
	}

	pub fn registry(&self) -> &Arc<SessionRegistry<CameraId>> {
		&self.registry
	}

	/// Launches a recording of the camera's main feed and returns the output filename.
	///
	/// Returns as soon as the encoder is running; the file starts out empty.
	pub async fn start_recording(&self, camera_id: &str) -> SessionResult<String> {
		if !is_valid_camera_id(camera_id) {
			return Err(SessionError::InvalidCameraId);
		}
		let key: CameraId = camera_id.to_string();
		if self.registry.lookup(&key).await.is_some() {
			return Err(SessionError::AlreadyRecording(key));
		}
		let source = self.cameras.resolve(camera_id, Quality::Main)
			.cloned()
			.ok_or_else(|| SessionError::UnknownSource { camera_id: key.clone(), quality: Quality::Main })?;

		let filename = recording_filename(camera_id, Utc::now());
		let job = EncodeJob {
			label: format!("recording-{}", camera_id),
			source,
			output: self.recording_dir.join(&filename),
			profile: EncodeProfile::Recording,
		};

		let (pipeline, launched) = self.registry
			.get_or_launch(key.clone(), || async {
				tokio::fs::create_dir_all(&self.recording_dir).await?;
				Pipeline::start(key.clone(), &job, self.backend.as_ref())
			})
			.await
			.map_err(|err| {
				error!("Failed to start recording for camera {}: {}", camera_id, err);
				err
			})?;
		if !launched {
			return Err(SessionError::AlreadyRecording(key));
		}
		pipeline.supervise(Arc::clone(&self.registry));

		info!("Recording started for camera {}: {}", camera_id, filename);
		Ok(filename)
	}

	/// Stops the camera's recording and waits for the encoder to finalize the file.
	pub async fn stop_recording(&self, camera_id: &str) -> SessionResult<RecordingSession> {
		if !is_valid_camera_id(camera_id) {
			return Err(SessionError::InvalidCameraId);
		}
		let key: CameraId = camera_id.to_string();
		let pipeline = self.registry.lookup(&key).await
			.ok_or_else(|| SessionError::NotRecording(key.clone()))?;
		// Whoever deregisters the pipeline owns its finalization
		if !self.registry.remove_if(&key, pipeline.id()).await {
			return Err(SessionError::NotRecording(key));
		}

		if let Err(err) = pipeline.request_graceful_stop().await {
			warn!("Graceful stop of recording for camera {} failed: {}", camera_id, err);
		}
		let duration = pipeline.elapsed().as_secs_f64();

		if timeout(self.settings.finalize_timeout(), pipeline.exited()).await.is_err() {
			warn!("Recording encoder for camera {} still running after {:?}", camera_id, self.settings.finalize_timeout());
		}
		let output = pipeline.output_path().to_path_buf();
		if !self.wait_for_content(&output).await {
			warn!("Recording {} is still empty after {:?}", output.display(), self.settings.finalize_timeout());
		}
		// The container index is written after the last media bytes
		sleep(self.settings.grace()).await;

		let session = RecordingSession {
			camera_id: key,
			filename: file_name(&output),
			duration,
			completed_at: Utc::now(),
		};
		info!(
			"Recording stopped for camera {}: {} (started {}, {:.1}s)",
			camera_id,
			session.filename,
			pipeline.started_at().to_rfc3339_opts(SecondsFormat::Secs, true),
			session.duration
		);
		Ok(session)
	}

	async fn wait_for_content(&self, path: &Path) -> bool {
		let deadline = Instant::now() + self.settings.finalize_timeout();
		loop {
			if let Ok(metadata) = tokio::fs::metadata(path).await {
				if metadata.len() > 0 {
					return true;
				}
			}
			if Instant::now() >= deadline {
				return false;
			}
			sleep(self.settings.poll_interval()).await;
		}
	}

	/// Deletes a completed recording. Only plain filenames inside the recording directory are accepted.
	pub async fn delete_recording(&self, filename: &str) -> SessionResult<()> {
		let path = self.resolve_recording(filename)?;
		if self.is_active(&path).await {
			return Err(SessionError::RecordingInUse(filename.to_string()));
		}
		match tokio::fs::remove_file(&path).await {
			Ok(()) => {
				info!("Deleted recording {}", filename);
				Ok(())
			},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				Err(SessionError::RecordingNotFound(filename.to_string()))
			},
			Err(err) => Err(err.into()),
		}
	}

	/// Completed recordings, newest first.
	pub async fn list_recordings(&self) -> SessionResult<Vec<StoredRecording>> {
		let mut entries = match tokio::fs::read_dir(&self.recording_dir).await {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};
		let mut recordings = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let metadata = match entry.metadata().await {
				Ok(metadata) => metadata,
				// Deleted since the directory was read
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
				Err(err) => return Err(err.into()),
			};
			if !metadata.is_file() || self.is_active(&entry.path()).await {
				continue;
			}
			recordings.push(StoredRecording {
				filename: entry.file_name().to_string_lossy().into_owned(),
				size: metadata.len(),
				modified: metadata.modified().ok().map(DateTime::<Utc>::from),
			});
		}
		recordings.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.filename.cmp(&a.filename)));
		Ok(recordings)
	}

	fn resolve_recording(&self, filename: &str) -> SessionResult<PathBuf> {
		let mut components = Path::new(filename).components();
		match (components.next(), components.next()) {
			(Some(Component::Normal(name)), None) if !filename.contains('\\') => {
				Ok(self.recording_dir.join(name))
			},
			_ => Err(SessionError::InvalidFilename),
		}
	}

	async fn is_active(&self, path: &Path) -> bool {
		self.registry.snapshot().await
			.iter()
			.any(|pipeline| pipeline.output_path() == path)
	}

	/// Asks every recording to finalize. Does not wait for the files.
	pub async fn shutdown(&self) {
		for pipeline in self.registry.drain().await {
			info!("Stopping recording for camera {} at shutdown", pipeline.key());
			if let Err(err) = pipeline.request_graceful_stop().await {
				warn!("Failed to stop recording for camera {}: {}", pipeline.key(), err);
			}
		}
	}
}

/// `camera<id>_<timestamp>.mp4`, with `:` and `.` in the timestamp replaced so the name is filesystem-safe.
pub fn recording_filename(camera_id: &str, at: DateTime<Utc>) -> String {
	let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, true).replace([':', '.'], "-");
	format!("camera{}_{}.mp4", camera_id, timestamp)
}

fn file_name(path: &Path) -> String {
	path.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default()
}

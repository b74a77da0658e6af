use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::time::{sleep, Instant};

use crate::common::{is_valid_camera_id, CameraDirectory, LiveKey, Quality};
use crate::config::LiveSettings;
use crate::error::{SessionError, SessionResult};
use crate::pipeline::{EncodeJob, EncodeProfile, EncoderBackend, Pipeline};
use crate::registry::SessionRegistry;



/// Where a viewer should fetch the playlist of a live session.
#[derive(Clone)]
#[derive(Debug)]
pub struct LiveView {
	pub key: LiveKey,
	/// URL path of the playlist, relative to the server root.
	pub playlist_url: String,
	pub playlist_path: PathBuf,
	/// Whether the playlist existed when the reference was handed out.
	pub ready: bool,
}

pub struct StreamController {
	cameras: Arc<CameraDirectory>,
	backend: Arc<dyn EncoderBackend>,
	registry: Arc<SessionRegistry<LiveKey>>,
	stream_dir: PathBuf,
	settings: LiveSettings,
}

impl StreamController {
	pub fn new(
		cameras: Arc<CameraDirectory>,
		backend: Arc<dyn EncoderBackend>,
		stream_dir: PathBuf,
		settings: LiveSettings,
	) -> Self {
		Self {
			cameras,
			backend,
			registry: Arc::new(SessionRegistry::new()),
			stream_dir,
			settings,
		}
	}

	pub fn registry(&self) -> &Arc<SessionRegistry<LiveKey>> {
		&self.registry
	}

	fn camera_dir(&self, key: &LiveKey) -> PathBuf {
		self.stream_dir.join(&key.camera_id)
	}

	fn playlist_path(&self, key: &LiveKey) -> PathBuf {
		self.camera_dir(key).join(format!("{}.m3u8", key.quality))
	}

	/// Makes sure a live pipeline runs for the camera/quality and returns its playlist.
	///
	/// Idempotent: an already running session is reused. Waits a bounded time for the
	/// playlist to appear, but a missing playlist is not an error; players retry on 404.
	pub async fn ensure_live_view(&self, camera_id: &str, quality: Quality) -> SessionResult<LiveView> {
		if !is_valid_camera_id(camera_id) {
			return Err(SessionError::InvalidCameraId);
		}
		let source = self.cameras.resolve(camera_id, quality)
			.cloned()
			.ok_or_else(|| SessionError::UnknownSource { camera_id: camera_id.to_string(), quality })?;

		let key = LiveKey { camera_id: camera_id.to_string(), quality };
		let camera_dir = self.camera_dir(&key);
		let playlist_path = self.playlist_path(&key);

		let job = EncodeJob {
			label: key.to_string(),
			source,
			output: playlist_path.clone(),
			profile: EncodeProfile::Live {
				quality,
				segment_pattern: camera_dir.join(format!("{}_%03d.ts", quality)),
				segment_seconds: self.settings.segment_seconds,
				playlist_size: self.settings.playlist_size,
				read_timeout: std::time::Duration::from_secs(self.settings.read_timeout_secs),
			},
		};

		let (pipeline, launched) = self.registry
			.get_or_launch(key.clone(), || async {
				info!("Starting live stream for camera {} ({})", key.camera_id, key.quality);
				tokio::fs::create_dir_all(&camera_dir).await?;
				// Nothing is registered for this key, so nobody is writing these files
				remove_stale_artifacts(&camera_dir, quality).await;
				Pipeline::start(key.clone(), &job, self.backend.as_ref())
			})
			.await
			.map_err(|err| {
				error!("Stream creation failed for {}: {}", key, err);
				err
			})?;
		if launched {
			pipeline.supervise(Arc::clone(&self.registry));
		}

		let ready = self.wait_for_playlist(&pipeline, &playlist_path).await;
		if !ready {
			if launched && !pipeline.is_alive() {
				let outcome = pipeline.exited().await;
				return Err(SessionError::Launch {
					key: key.to_string(),
					reason: format!("encoder {} before producing a playlist", outcome),
				});
			}
			info!("Playlist for {} not ready yet; returning reference anyway", key);
		}

		Ok(LiveView {
			playlist_url: format!("/streams/{}/{}.m3u8", key.camera_id, key.quality),
			key,
			playlist_path,
			ready,
		})
	}

	async fn wait_for_playlist(&self, pipeline: &Pipeline<LiveKey>, playlist_path: &Path) -> bool {
		let deadline = Instant::now() + self.settings.ready_timeout();
		loop {
			if tokio::fs::try_exists(playlist_path).await.unwrap_or(false) {
				return true;
			}
			if !pipeline.is_alive() || Instant::now() >= deadline {
				return false;
			}
			sleep(self.settings.poll_interval()).await;
		}
	}

	/// Asks every live pipeline to stop and forgets them.
	pub async fn shutdown(&self) {
		for pipeline in self.registry.drain().await {
			if let Err(err) = pipeline.request_graceful_stop().await {
				warn!("Failed to stop live pipeline for {}: {}", pipeline.key(), err);
			}
		}
	}
}

/// Deletes a previous run's playlist and segments for one quality.
async fn remove_stale_artifacts(camera_dir: &Path, quality: Quality) {
	let playlist = format!("{}.m3u8", quality);
	let segment_prefix = format!("{}_", quality);
	if let Err(err) = remove_matching(camera_dir, |name| {
		name == playlist || (name.starts_with(&segment_prefix) && name.ends_with(".ts"))
	}).await {
		error!("Error cleaning up old files in {}: {}", camera_dir.display(), err);
	}
}

async fn remove_matching<F: Fn(&str) -> bool>(dir: &Path, matches: F) -> io::Result<()> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name();
		let Some(name) = name.to_str() else {
			continue;
		};
		if matches(name) {
			tokio::fs::remove_file(entry.path()).await?;
		}
	}
	Ok(())
}

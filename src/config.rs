use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use log::{info, warn};
use url::Url;

use crate::common::{is_valid_camera_id, CameraMap, CameraSource, Quality};



const DEFAULT_CONFIG_FILES: [&str; 2] = [
	"/etc/camera-stream-mgr/config.toml",
	"camera-stream-mgr.toml",
];

const SOURCE_SCHEMES: [&str; 3] = ["rtsp", "rtsps", "file"];

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub ffmpeg: PathBuf,
	pub stream_dir: PathBuf,
	pub recording_dir: PathBuf,
	pub live: LiveSettings,
	pub recording: RecordingSettings,
	pub cameras: CameraMap,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			ffmpeg: PathBuf::from("ffmpeg"),
			stream_dir: PathBuf::from("public/streams"),
			recording_dir: PathBuf::from("public/recordings"),
			live: LiveSettings::default(),
			recording: RecordingSettings::default(),
			cameras: CameraMap::new(),
		}
	}
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveSettings {
	pub poll_interval_ms: u64,
	pub ready_timeout_ms: u64,
	pub segment_seconds: u32,
	pub playlist_size: u32,
	pub read_timeout_secs: u64,
}

impl Default for LiveSettings {
	fn default() -> Self {
		Self {
			poll_interval_ms: 100,
			ready_timeout_ms: 2000,
			segment_seconds: 2,
			playlist_size: 3,
			read_timeout_secs: 10,
		}
	}
}

impl LiveSettings {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(1))
	}

	pub fn ready_timeout(&self) -> Duration {
		Duration::from_millis(self.ready_timeout_ms)
	}
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingSettings {
	pub poll_interval_ms: u64,
	pub finalize_timeout_ms: u64,
	pub grace_ms: u64,
}

impl Default for RecordingSettings {
	fn default() -> Self {
		Self {
			poll_interval_ms: 250,
			finalize_timeout_ms: 10_000,
			grace_ms: 2000,
		}
	}
}

impl RecordingSettings {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(1))
	}

	pub fn finalize_timeout(&self) -> Duration {
		Duration::from_millis(self.finalize_timeout_ms)
	}

	pub fn grace(&self) -> Duration {
		Duration::from_millis(self.grace_ms)
	}
}

impl Config {
	/// Reads and merges the given TOML files in order, later files overriding earlier ones.
	pub fn read_files<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Self> {
		let mut merged = toml::Table::new();
		for path in paths {
			let path = path.as_ref();
			let text = std::fs::read_to_string(path)
				.with_context(|| format!("Failed to read config file {}", path.display()))?;
			let table: toml::Table = text.parse()
				.with_context(|| format!("Failed to parse config file {}", path.display()))?;
			merge_tables(&mut merged, table);
			info!("Read config file {}", path.display());
		}
		let config: Config = toml::Value::Table(merged).try_into()
			.context("Invalid configuration")?;
		Ok(config)
	}

	pub fn read_default_files() -> anyhow::Result<Self> {
		let present: Vec<&str> = DEFAULT_CONFIG_FILES.iter()
			.copied()
			.filter(|path| Path::new(path).is_file())
			.collect();
		if present.is_empty() {
			// Cameras may still come from the environment
			warn!("No config file found; using defaults");
		}
		Self::read_files(&present)
	}

	/// Applies `CAMERA<ID>_RTSP_MAIN` / `CAMERA<ID>_RTSP_SUB` variables on top of the file config.
	pub fn apply_env(&mut self) -> anyhow::Result<()> {
		self.apply_vars(env::vars_os().filter_map(|(name, value)| {
			Some((name.into_string().ok()?, value.into_string().ok()?))
		}))
	}

	fn apply_vars<I: IntoIterator<Item = (String, String)>>(&mut self, vars: I) -> anyhow::Result<()> {
		for (name, value) in vars {
			let Some((camera_id, quality)) = parse_camera_var(&name) else {
				continue;
			};
			let source = self.cameras.entry(camera_id.to_string()).or_default();
			let url = if value.trim().is_empty() {
				None
			} else {
				Some(Url::parse(value.trim()).with_context(|| format!("Invalid URL in {}", name))?)
			};
			match quality {
				Quality::Main => source.main = url,
				Quality::Sub => source.sub = url,
			}
		}
		Ok(())
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		for (id, source) in &self.cameras {
			if !is_valid_camera_id(id) {
				bail!("Invalid camera id {:?}", id);
			}
			for url in [&source.main, &source.sub].into_iter().flatten() {
				if !SOURCE_SCHEMES.contains(&url.scheme()) {
					bail!("Camera {} has unsupported source scheme {:?}", id, url.scheme());
				}
			}
		}
		Ok(())
	}

	pub fn create_directories(&self) -> anyhow::Result<()> {
		for dir in [&self.stream_dir, &self.recording_dir] {
			std::fs::create_dir_all(dir)
				.with_context(|| format!("Failed to create directory {}", dir.display()))?;
		}
		Ok(())
	}
}

fn parse_camera_var(name: &str) -> Option<(&str, Quality)> {
	let rest = name.strip_prefix("CAMERA")?;
	let (camera_id, quality) = if let Some(id) = rest.strip_suffix("_RTSP_MAIN") {
		(id, Quality::Main)
	} else if let Some(id) = rest.strip_suffix("_RTSP_SUB") {
		(id, Quality::Sub)
	} else {
		return None;
	};
	is_valid_camera_id(camera_id).then_some((camera_id, quality))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
	for (key, value) in overlay {
		match value {
			toml::Value::Table(incoming) => match base.get_mut(&key) {
				Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
				_ => {
					base.insert(key, toml::Value::Table(incoming));
				},
			},
			value => {
				base.insert(key, value);
			},
		}
	}
}

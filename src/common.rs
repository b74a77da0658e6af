use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use url::Url;



pub type CameraId = String;
pub type CameraMap = BTreeMap<CameraId, CameraSource>;

const MAX_CAMERA_ID_LEN: usize = 32;

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum Quality {
	Main,
	Sub,
}

impl Quality {
	pub fn as_str(&self) -> &'static str {
		match self {
			Quality::Main => "main",
			Quality::Sub => "sub",
		}
	}
}

impl fmt::Display for Quality {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Quality {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"main" => Ok(Quality::Main),
			"sub" => Ok(Quality::Sub),
			_ => Err(()),
		}
	}
}

/// Identity of a live-view pipeline. Each camera can have one per quality.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LiveKey {
	pub camera_id: CameraId,
	pub quality: Quality,
}

impl fmt::Display for LiveKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.camera_id, self.quality)
	}
}

#[derive(Clone)]
#[derive(Debug, Default)]
#[derive(Serialize, Deserialize)]
pub struct CameraSource {
	pub main: Option<Url>,
	pub sub: Option<Url>,
}

impl CameraSource {
	pub fn url(&self, quality: Quality) -> Option<&Url> {
		match quality {
			Quality::Main => self.main.as_ref(),
			Quality::Sub => self.sub.as_ref(),
		}
	}
}

/// Static camera id -> source URL map. Built once at startup and never mutated.
#[derive(Debug, Default)]
pub struct CameraDirectory {
	cameras: CameraMap,
}

impl CameraDirectory {
	pub fn new(cameras: CameraMap) -> Self {
		Self { cameras }
	}

	pub fn resolve(&self, camera_id: &str, quality: Quality) -> Option<&Url> {
		self.cameras.get(camera_id).and_then(|source| source.url(quality))
	}

	pub fn ids(&self) -> impl Iterator<Item = &CameraId> {
		self.cameras.keys()
	}
}

/// Camera ids end up in filesystem paths, so only a conservative character set is allowed.
pub fn is_valid_camera_id(id: &str) -> bool {
	!id.is_empty()
		&& id.len() <= MAX_CAMERA_ID_LEN
		&& id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

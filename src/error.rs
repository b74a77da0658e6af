use std::io;

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::json;
use thiserror::Error;

use crate::common::{CameraId, Quality};



#[derive(Error, Debug)]
pub enum SessionError {
	#[error("Invalid camera ID")]
	InvalidCameraId,

	#[error("Camera ID is required")]
	MissingCameraId,

	#[error("Unknown stream quality {0:?}")]
	UnknownQuality(String),

	#[error("Camera {camera_id} has no {quality} stream configured")]
	UnknownSource {
		camera_id: CameraId,
		quality: Quality,
	},

	#[error("Already recording camera {0}")]
	AlreadyRecording(CameraId),

	#[error("No active recording for camera {0}")]
	NotRecording(CameraId),

	#[error("Failed to launch encoder for {key}: {reason}")]
	Launch {
		key: String,
		reason: String,
	},

	#[error("Invalid recording filename")]
	InvalidFilename,

	#[error("Recording {0} not found")]
	RecordingNotFound(String),

	#[error("Recording {0} is still in progress")]
	RecordingInUse(String),

	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl SessionError {
	pub fn status(&self) -> Status {
		match self {
			SessionError::InvalidCameraId
			| SessionError::MissingCameraId
			| SessionError::AlreadyRecording(_)
			| SessionError::NotRecording(_)
			| SessionError::InvalidFilename
			| SessionError::RecordingInUse(_) => Status::BadRequest,
			SessionError::UnknownSource { .. }
			| SessionError::UnknownQuality(_)
			| SessionError::RecordingNotFound(_) => Status::NotFound,
			SessionError::Launch { .. }
			| SessionError::Io(_) => Status::InternalServerError,
		}
	}
}

impl<'r> Responder<'r, 'static> for SessionError {
	fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
		let status = self.status();
		let body = json!({ "error": self.to_string() });
		Response::build_from(body.respond_to(request)?)
			.status(status)
			.ok()
	}
}

pub type SessionResult<T> = Result<T, SessionError>;

use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::fs::FileServer;
use rocket::http::Status;
use rocket::response::Redirect;
use rocket::serde::json::{json, Json, Value};
use rocket::{Request, State};

use log::{debug, info};

use crate::common::{CameraDirectory, CameraId, Quality};
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::pipeline::EncoderBackend;
use crate::recording::{RecordingController, StoredRecording};
use crate::stream::StreamController;



#[derive(Debug, Default)]
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartRecordingRequest {
	camera_id: Option<Value>,
	quality: Option<String>,
}

#[derive(Debug, Default)]
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StopRecordingRequest {
	camera_id: Option<Value>,
}

/// Camera ids arrive as strings from the UI, but numbers are accepted too.
fn camera_id_from(value: Option<&Value>) -> SessionResult<CameraId> {
	match value {
		Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
		Some(Value::Number(id)) => Ok(id.to_string()),
		None | Some(Value::Null) | Some(Value::String(_)) => Err(SessionError::MissingCameraId),
		Some(_) => Err(SessionError::InvalidCameraId),
	}
}

fn parse_quality(quality: Option<&str>) -> SessionResult<Quality> {
	match quality {
		None | Some("") => Ok(Quality::Sub),
		Some(value) => value.parse().map_err(|_| SessionError::UnknownQuality(value.to_string())),
	}
}

#[get("/stream/<camera_id>?<quality>")]
async fn live_stream(camera_id: &str, quality: Option<&str>, streams: &State<StreamController>) -> SessionResult<Redirect> {
	let quality = parse_quality(quality)?;
	let view = streams.ensure_live_view(camera_id, quality).await?;
	debug!("Live view {} at {} (ready: {})", view.key, view.playlist_path.display(), view.ready);
	Ok(Redirect::to(view.playlist_url))
}

#[post("/recording/start", data = "<request>")]
async fn start_recording(request: Json<StartRecordingRequest>, recordings: &State<RecordingController>) -> SessionResult<Value> {
	let camera_id = camera_id_from(request.camera_id.as_ref())?;
	if let Some(quality) = request.quality.as_deref() {
		if quality != "main" {
			debug!("Recording camera {} from main feed although {} was requested", camera_id, quality);
		}
	}
	let filename = recordings.start_recording(&camera_id).await?;
	Ok(json!({
		"success": true,
		"message": "Recording started",
		"filename": filename,
	}))
}

#[post("/recording/stop", data = "<request>")]
async fn stop_recording(request: Json<StopRecordingRequest>, recordings: &State<RecordingController>) -> SessionResult<Value> {
	let camera_id = camera_id_from(request.camera_id.as_ref())?;
	let session = recordings.stop_recording(&camera_id).await?;
	Ok(json!({
		"success": true,
		"message": "Recording stopped",
		"filename": session.filename,
		"cameraId": session.camera_id,
		"duration": session.duration,
		"completedAt": session.completed_at,
	}))
}

#[get("/recording")]
async fn list_recordings(recordings: &State<RecordingController>) -> SessionResult<Json<Vec<StoredRecording>>> {
	Ok(Json(recordings.list_recordings().await?))
}

#[delete("/recording?<filename>")]
async fn delete_recording(filename: Option<&str>, recordings: &State<RecordingController>) -> SessionResult<Value> {
	let filename = filename.ok_or(SessionError::InvalidFilename)?;
	recordings.delete_recording(filename).await?;
	Ok(json!({
		"success": true,
		"message": "Recording deleted successfully",
		"filename": filename,
	}))
}

#[catch(404)]
fn not_found() -> Value {
	json!({
		"status": "error",
		"reason": "Resource was not found."
	})
}

#[catch(default)]
fn default_catcher(status: Status, _request: &Request) -> Value {
	json!({
		"status": "error",
		"reason": status.reason().unwrap_or("Unknown error"),
	})
}



pub fn stage(config: Config, backend: Arc<dyn EncoderBackend>) -> AdHoc {
	let cameras = Arc::new(CameraDirectory::new(config.cameras.clone()));
	let camera_ids: Vec<String> = cameras.ids().cloned().collect();
	let streams = StreamController::new(
		Arc::clone(&cameras),
		Arc::clone(&backend),
		config.stream_dir.clone(),
		config.live.clone(),
	);
	let recordings = RecordingController::new(
		cameras,
		backend,
		config.recording_dir.clone(),
		config.recording.clone(),
	);

	AdHoc::on_ignite("Camera sessions", move |rocket| async move {
		info!("Configured cameras: {:?}", camera_ids);
		rocket
			.manage(streams)
			.manage(recordings)
			.register("/", catchers![not_found, default_catcher])
			.mount("/", routes![live_stream, start_recording, stop_recording, list_recordings, delete_recording])
			.mount("/streams", FileServer::from(&config.stream_dir))
			.mount("/recordings", FileServer::from(&config.recording_dir))
			.attach(AdHoc::on_shutdown("Stop pipelines", |rocket| Box::pin(async move {
				if let Some(streams) = rocket.state::<StreamController>() {
					info!("Stopping {} live pipelines", streams.registry().len().await);
					streams.shutdown().await;
				}
				if let Some(recordings) = rocket.state::<RecordingController>() {
					info!("Stopping {} recordings", recordings.registry().len().await);
					recordings.shutdown().await;
				}
			})))
	})
}

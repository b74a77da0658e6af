#[macro_use] extern crate rocket;
#[macro_use] extern crate serde_derive;

use std::sync::Arc;

use anyhow::Context;
use clap::{Command, Arg, ArgAction};
use rocket::{Request, Response};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;

mod common;
mod config;
mod error;
mod ffmpeg;
mod pipeline;
mod recording;
mod registry;
mod rest_api;
mod stream;
#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::ffmpeg::FfmpegBackend;



// The UI is served by another server, so it needs CORS to call this one.
pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
	fn info(&self) -> Info {
		Info {
			name: "Add CORS headers to responses",
			kind: Kind::Response
		}
	}

	async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
		response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
		response.set_header(Header::new("Access-Control-Allow-Methods", "POST, GET, DELETE, OPTIONS"));
		response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
		response.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
	}
}


#[rocket::main]
async fn main() -> anyhow::Result<()> {
	let matches = Command::new("camera-stream-mgr")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Live view and recording of RTSP cameras through ffmpeg.")
		.arg(
			Arg::new("config")
				.action(ArgAction::Append)	// Allow argument to be specified multiple times
				.short('c')
				.long("config")
				.help("TOML file with camera and encoder config")
		)
		.get_matches();

	let mut config = match matches.get_many::<String>("config") {
		Some(filenames) => {
			let filenames: Vec<&str> = filenames.map(|v| v.as_str()).collect();
			Config::read_files(&filenames)?
		},
		None => {
			// Use default file paths
			Config::read_default_files()?
		}
	};
	config.apply_env().context("Invalid camera URL in environment")?;
	config.validate()?;
	config.create_directories()?;

	let backend = Arc::new(FfmpegBackend::new(config.ffmpeg.clone()));
	rocket::build()
		.attach(rest_api::stage(config, backend))
		.attach(CORS)
		.launch()
		.await?;

	anyhow::Ok(())
}

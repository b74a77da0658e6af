use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use url::Url;

use crate::common::Quality;
use crate::pipeline::{EncodeJob, EncodeProfile, EncoderBackend, EncoderProcess, ProcessExit, StopRequest};



/// Runs encoders as local ffmpeg processes.
pub struct FfmpegBackend {
	binary: PathBuf,
}

impl FfmpegBackend {
	pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
		Self { binary: binary.into() }
	}
}

impl EncoderBackend for FfmpegBackend {
	fn spawn(&self, job: &EncodeJob) -> io::Result<Box<dyn EncoderProcess>> {
		let args = build_args(job);
		info!("Starting ffmpeg for {}: {} {}", job.label, self.binary.display(), args.join(" "));

		let mut child = Command::new(&self.binary)
			.args(&args)
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.spawn()?;

		let pid = child.id();
		let stdin = child.stdin.take();
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(log_stderr(job.label.clone(), stderr));
		}

		let (exit_tx, exit_rx) = watch::channel(None);
		let label = job.label.clone();
		tokio::spawn(async move {
			let outcome = match child.wait().await {
				Ok(status) if status.success() => ProcessExit::Success,
				Ok(status) => ProcessExit::Failed(status.code()),
				Err(err) => {
					error!("Failed to wait on ffmpeg for {}: {}", label, err);
					ProcessExit::Lost(err.to_string())
				},
			};
			exit_tx.send_replace(Some(outcome));
		});

		Ok(Box::new(FfmpegProcess {
			pid,
			stdin: Mutex::new(stdin),
			exit: exit_rx,
		}))
	}
}

struct FfmpegProcess {
	pid: Option<u32>,
	stdin: Mutex<Option<ChildStdin>>,
	exit: watch::Receiver<Option<ProcessExit>>,
}

#[rocket::async_trait]
impl EncoderProcess for FfmpegProcess {
	fn pid(&self) -> Option<u32> {
		self.pid
	}

	async fn request_graceful_stop(&self) -> io::Result<StopRequest> {
		if !self.is_alive() {
			return Ok(StopRequest::AlreadyExited);
		}

		// ffmpeg treats "q" on stdin as a request to finish the output and exit
		let mut stdin = self.stdin.lock().await;
		if let Some(pipe) = stdin.as_mut() {
			let sent = match pipe.write_all(b"q").await {
				Ok(()) => pipe.flush().await,
				Err(err) => Err(err),
			};
			match sent {
				Ok(()) => return Ok(StopRequest::Quit),
				Err(err) => {
					warn!("Could not write quit command to ffmpeg (pid {:?}): {}", self.pid, err);
					*stdin = None;
				},
			}
		}
		drop(stdin);

		let Some(pid) = self.pid else {
			return Ok(StopRequest::AlreadyExited);
		};
		interrupt(pid)?;
		Ok(StopRequest::Interrupt)
	}

	fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
		self.exit.clone()
	}
}

#[cfg(unix)]
fn interrupt(pid: u32) -> io::Result<()> {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;

	let pid = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
	kill(Pid::from_raw(pid), Signal::SIGINT)?;
	Ok(())
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) -> io::Result<()> {
	Err(io::Error::new(io::ErrorKind::Unsupported, "interrupt signals are not supported on this platform"))
}

async fn log_stderr(label: String, stderr: ChildStderr) {
	let mut lines = BufReader::new(stderr).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				let lower = line.to_ascii_lowercase();
				if lower.contains("error") || lower.contains("fail") {
					error!("ffmpeg [{}]: {}", label, line);
				} else {
					debug!("ffmpeg [{}]: {}", label, line);
				}
			},
			Ok(None) => break,
			Err(err) => {
				debug!("Stopped reading ffmpeg stderr for {}: {}", label, err);
				break;
			},
		}
	}
}

fn is_rtsp(source: &Url) -> bool {
	matches!(source.scheme(), "rtsp" | "rtsps")
}

fn input_path(source: &Url) -> String {
	if source.scheme() == "file" {
		if let Ok(path) = source.to_file_path() {
			return path.display().to_string();
		}
	}
	source.to_string()
}

fn crf(quality: Quality) -> &'static str {
	// Main feeds downstream analysis, so it keeps more detail than the preview feed
	match quality {
		Quality::Main => "23",
		Quality::Sub => "28",
	}
}

pub fn build_args(job: &EncodeJob) -> Vec<String> {
	let mut args = Vec::new();
	push(&mut args, &["-hide_banner", "-nostats"]);

	if is_rtsp(&job.source) {
		push(&mut args, &["-rtsp_transport", "tcp"]);
		if let EncodeProfile::Live { read_timeout, .. } = &job.profile {
			push(&mut args, &["-timeout", &read_timeout.as_micros().to_string()]);
			push(&mut args, &["-err_detect", "ignore_err"]);
		}
	} else {
		// Local clips stand in for a camera: replay forever at native rate
		push(&mut args, &["-re", "-stream_loop", "-1"]);
	}
	push(&mut args, &["-i", &input_path(&job.source)]);

	match &job.profile {
		EncodeProfile::Live { quality, segment_pattern, segment_seconds, playlist_size, .. } => {
			push(&mut args, &[
				"-c:v", "libx264",
				"-preset", "superfast",
				"-tune", "zerolatency",
				"-crf", crf(*quality),
				"-pix_fmt", "yuv420p",
				"-c:a", "aac",
				"-ar", "44100",
				"-ac", "2",
				"-b:a", "128k",
				"-f", "hls",
				"-hls_time", &segment_seconds.to_string(),
				"-hls_list_size", &playlist_size.to_string(),
				"-hls_flags", "delete_segments",
				"-hls_allow_cache", "0",
				"-hls_segment_filename", &path_arg(segment_pattern),
			]);
		},
		EncodeProfile::Recording => {
			push(&mut args, &[
				"-c:v", "libx264",
				"-preset", "superfast",
				"-crf", "23",
				"-pix_fmt", "yuv420p",
				"-movflags", "+faststart",
				"-vsync", "1",
				"-max_muxing_queue_size", "1024",
				"-c:a", "aac",
				"-b:a", "128k",
			]);
		},
	}

	push(&mut args, &["-y", &path_arg(&job.output)]);
	args
}

fn push(args: &mut Vec<String>, items: &[&str]) {
	args.extend(items.iter().map(|item| item.to_string()));
}

fn path_arg(path: &Path) -> String {
	path.display().to_string()
}

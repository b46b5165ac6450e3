//! FFmpeg-backed [`FrameDecoder`]: one short-lived `ffmpeg` process per frame.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::gateway::{DecodedFrame, FrameDecoder, FrameRequest};

const DEFAULT_DECODE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    fn from_params(request: &FrameRequest) -> Self {
        match request.params.get("format").map(String::as_str) {
            Some("jpeg") | Some("jpg") => Self::Jpeg,
            _ => Self::Png,
        }
    }

    fn codec(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "mjpeg",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

pub struct FfmpegFrameDecoder {
    program: PathBuf,
    timeout: Duration,
    shut_down: AtomicBool,
}

impl FfmpegFrameDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_DECODE_TIMEOUT,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub(crate) fn ffmpeg_args(request: &FrameRequest) -> Vec<String> {
    let format = OutputFormat::from_params(request);
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        format!("{:.6}", request.time.max(0.0)),
        "-i".to_string(),
        request.src.clone(),
        "-frames:v".to_string(),
        "1".to_string(),
    ];

    let width = request.params.get("width").and_then(|w| w.parse::<u32>().ok());
    let height = request.params.get("height").and_then(|h| h.parse::<u32>().ok());
    if width.is_some() || height.is_some() {
        let dim = |value: Option<u32>| value.map_or_else(|| "-1".to_string(), |v| v.to_string());
        args.push("-vf".to_string());
        args.push(format!("scale={}:{}", dim(width), dim(height)));
    }

    args.extend(
        ["-f", "image2pipe", "-c:v", format.codec(), "-"]
            .into_iter()
            .map(str::to_string),
    );
    args
}

#[async_trait]
impl FrameDecoder for FfmpegFrameDecoder {
    async fn decode(&self, request: &FrameRequest) -> Result<DecodedFrame, DecodeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DecodeError::Fatal("frame decoder has been shut down".to_string()));
        }

        let args = ffmpeg_args(request);
        debug!(program = %self.program.display(), ?args, "Spawning frame decoder");
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    DecodeError::Fatal(format!(
                        "{} not found; is FFmpeg installed?",
                        self.program.display()
                    ))
                } else {
                    DecodeError::Fatal(format!(
                        "failed to spawn {}: {err}",
                        self.program.display()
                    ))
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                DecodeError::Failed(format!(
                    "decoding {} at {}s timed out after {:?}",
                    request.src, request.time, self.timeout
                ))
            })?
            .map_err(|err| DecodeError::Failed(format!("failed to read decoder output: {err}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(target: "frame_decoder_stderr", "{}", line);
        }

        if !output.status.success() {
            warn!(src = %request.src, status = %output.status, "Frame decoder exited unsuccessfully");
            return Err(DecodeError::Failed(format!(
                "decoder exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(DecodeError::Failed(format!(
                "no frame at {}s in {}",
                request.time, request.src
            )));
        }

        Ok(DecodedFrame {
            data: Bytes::from(output.stdout),
            content_type: OutputFormat::from_params(request).content_type().to_string(),
        })
    }

    async fn shutdown(&self) -> Result<(), DecodeError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(params: &[(&str, &str)]) -> FrameRequest {
        FrameRequest {
            src: "/media/clip.mp4".to_string(),
            time: 1.25,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn args_seek_before_input_and_pipe_single_png() {
        let args = ffmpeg_args(&request(&[]));
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "1.250000");
        assert_eq!(args[input + 1], "/media/clip.mp4");
        assert!(args.ends_with(&[
            "-f".to_string(),
            "image2pipe".to_string(),
            "-c:v".to_string(),
            "png".to_string(),
            "-".to_string(),
        ]));
        assert!(!args.contains(&"-vf".to_string()));
    }

    #[test]
    fn args_honour_scale_and_format_params() {
        let args = ffmpeg_args(&request(&[("width", "320"), ("format", "jpeg")]));
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=320:-1");
        assert!(args.contains(&"mjpeg".to_string()));
        assert_eq!(
            OutputFormat::from_params(&request(&[("format", "jpeg")])).content_type(),
            "image/jpeg"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let decoder = FfmpegFrameDecoder::new("/nonexistent/renderq-test/ffmpeg");
        let err = decoder.decode(&request(&[])).await.expect_err("missing binary");
        assert!(matches!(err, DecodeError::Fatal(message) if message.contains("not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_per_request_failure() {
        let decoder = FfmpegFrameDecoder::new("false");
        let err = decoder.decode(&request(&[])).await.expect_err("false exits 1");
        assert!(matches!(err, DecodeError::Failed(_)));
    }

    #[tokio::test]
    async fn decode_after_shutdown_is_fatal() {
        let decoder = FfmpegFrameDecoder::new("ffmpeg");
        decoder.shutdown().await.unwrap();
        assert!(matches!(
            decoder.decode(&request(&[])).await,
            Err(DecodeError::Fatal(_))
        ));
    }
}

//! Render job requests and the read-only job snapshots handed to observers.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

const MAX_CRF: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Video,
    Sequence,
    Still,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Pdf,
    None,
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self::Png
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChromiumOptions {
    pub disable_web_security: bool,
    pub ignore_certificate_errors: bool,
    pub headless: Option<bool>,
    pub gl: Option<String>,
    pub user_agent: Option<String>,
}

/// Fields shared by every job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonRenderOptions {
    pub composition_id: String,
    pub out_name: String,
    #[serde(default)]
    pub image_format: ImageFormat,
    #[serde(default)]
    pub jpeg_quality: Option<u8>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub delay_render_timeout_in_milliseconds: Option<u64>,
    #[serde(default)]
    pub chromium_options: ChromiumOptions,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default = "default_input_props")]
    pub serialized_input_props_with_custom_schema: String,
    #[serde(default)]
    pub offthread_video_cache_size_in_bytes: Option<u64>,
    #[serde(default)]
    pub multi_process_on_linux: bool,
}

fn default_scale() -> f64 {
    1.0
}

fn default_input_props() -> String {
    "{}".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRequest {
    #[serde(flatten)]
    pub common: CommonRenderOptions,
    pub codec: String,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub crf: Option<u8>,
    pub start_frame: u64,
    pub end_frame: u64,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub enforce_audio_track: bool,
    #[serde(default)]
    pub pro_res_profile: Option<String>,
    #[serde(default)]
    pub x264_preset: Option<String>,
    #[serde(default)]
    pub pixel_format: Option<String>,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    #[serde(default)]
    pub video_bitrate: Option<String>,
    #[serde(default = "default_every_nth_frame")]
    pub every_nth_frame: u32,
    #[serde(default)]
    pub number_of_gif_loops: Option<u32>,
    #[serde(default)]
    pub disallow_parallel_encoding: bool,
    #[serde(default)]
    pub color_space: Option<String>,
}

fn default_every_nth_frame() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRequest {
    #[serde(flatten)]
    pub common: CommonRenderOptions,
    pub start_frame: u64,
    pub end_frame: u64,
    #[serde(default)]
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StillRequest {
    #[serde(flatten)]
    pub common: CommonRenderOptions,
    pub frame: u64,
}

/// A render request, tagged by kind on the wire (`"type": "video"` etc).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RenderRequest {
    Video(VideoRequest),
    Sequence(SequenceRequest),
    Still(StillRequest),
}

impl RenderRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Video(_) => JobKind::Video,
            Self::Sequence(_) => JobKind::Sequence,
            Self::Still(_) => JobKind::Still,
        }
    }

    pub fn common(&self) -> &CommonRenderOptions {
        match self {
            Self::Video(video) => &video.common,
            Self::Sequence(sequence) => &sequence.common,
            Self::Still(still) => &still.common,
        }
    }

    pub fn out_name(&self) -> &str {
        &self.common().out_name
    }

    pub fn composition_id(&self) -> &str {
        &self.common().composition_id
    }

    /// Inclusive frame range covered by this request.
    pub fn frame_range(&self) -> (u64, u64) {
        match self {
            Self::Video(video) => (video.start_frame, video.end_frame),
            Self::Sequence(sequence) => (sequence.start_frame, sequence.end_frame),
            Self::Still(still) => (still.frame, still.frame),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.common().delay_render_timeout_in_milliseconds
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        let common = self.common();
        if common.composition_id.trim().is_empty() {
            return Err(invalid("compositionId must not be empty"));
        }
        validate_out_name(&common.out_name)?;
        if let Some(quality) = common.jpeg_quality {
            if quality > 100 {
                return Err(invalid(format!(
                    "jpegQuality must be between 0 and 100, got {quality}"
                )));
            }
        }
        if !common.scale.is_finite() || common.scale <= 0.0 {
            return Err(invalid(format!(
                "scale must be a positive number, got {}",
                common.scale
            )));
        }

        match self {
            Self::Video(video) => {
                validate_frame_range(video.start_frame, video.end_frame)?;
                validate_concurrency(video.concurrency)?;
                if video.codec.trim().is_empty() {
                    return Err(invalid("codec must not be empty"));
                }
                if video.every_nth_frame == 0 {
                    return Err(invalid("everyNthFrame must be at least 1"));
                }
                if let Some(crf) = video.crf {
                    if crf > MAX_CRF {
                        return Err(invalid(format!("crf must be at most {MAX_CRF}, got {crf}")));
                    }
                }
            }
            Self::Sequence(sequence) => {
                validate_frame_range(sequence.start_frame, sequence.end_frame)?;
                validate_concurrency(sequence.concurrency)?;
            }
            Self::Still(_) => {}
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> QueueError {
    QueueError::InvalidRequest(message.into())
}

fn validate_out_name(out_name: &str) -> Result<(), QueueError> {
    if out_name.trim().is_empty() {
        return Err(invalid("outName must not be empty"));
    }
    let path = Path::new(out_name);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(invalid(format!(
            "outName must be a relative path inside the output directory: {out_name}"
        )));
    }
    Ok(())
}

fn validate_frame_range(start: u64, end: u64) -> Result<(), QueueError> {
    if start > end {
        return Err(invalid(format!(
            "startFrame ({start}) must not be greater than endFrame ({end})"
        )));
    }
    Ok(())
}

fn validate_concurrency(concurrency: Option<u32>) -> Result<(), QueueError> {
    if concurrency == Some(0) {
        return Err(invalid("concurrency must be at least 1"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStage {
    Preparing,
    Rendering,
    Encoding,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgress {
    pub stage: RenderStage,
    /// Overall completion in `0.0..=1.0`.
    pub value: f64,
    pub rendered_frames: u64,
    pub encoded_frames: u64,
    pub total_frames: Option<u64>,
}

impl RenderProgress {
    pub fn preparing() -> Self {
        Self {
            stage: RenderStage::Preparing,
            value: 0.0,
            rendered_frames: 0,
            encoded_frames: 0,
            total_frames: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub stack: Option<String>,
}

/// Point-in-time copy of a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub composition_id: String,
    pub out_name: String,
    pub request: RenderRequest,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<RenderProgress>,
    pub error: Option<JobError>,
    pub deleted_output_location: bool,
}

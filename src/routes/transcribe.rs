use std::str::FromStr;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::{JobId, MediaFormat, TranscribeParams};
use crate::models::result::JobResult;
use crate::services::dispatcher::{DispatchError, SubmitRequest};
use crate::services::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Malformed upload: {0}")]
    BadRequest(String),

    #[error("Unsupported media format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<JobId>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidParameters(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Dispatch(e) => match e {
                DispatchError::InvalidParameters(_) => StatusCode::UNPROCESSABLE_ENTITY,
                DispatchError::StageFailure(StorageError::TooLarge { .. }) => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                DispatchError::StageFailure(StorageError::Empty) => StatusCode::BAD_REQUEST,
                DispatchError::StageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                DispatchError::Queue(_) | DispatchError::Closed { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Transcription request failed");
        }
        let job_id = match &self {
            Self::Dispatch(e) => e.job_id(),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            job_id,
        };
        (status, Json(body)).into_response()
    }
}

/// POST /api/v1/transcribe — upload media and wait for its transcript.
///
/// Multipart fields: `file` (required), `model`, `language`, `diarize`,
/// `num_speakers`, `min_speakers`, `max_speakers`, `requester`. Both success
/// and processing failure come back as 200 with the result record.
pub async fn submit_transcription(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<JobResult>, ApiError> {
    let mut upload: Option<(Vec<u8>, MediaFormat)> = None;
    let mut params = state.defaults.clone();
    let mut requester = serde_json::Value::Null;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == "file" {
            let format = detect_format(field.file_name(), field.content_type())?;
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            upload = Some((data.to_vec(), format));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        apply_field(&mut params, &mut requester, &name, value.trim())?;
    }

    let (data, format) = upload.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    apply_diarize_bounds(&mut params, state.diarize_bounds);

    let result = state
        .dispatcher
        .submit(
            SubmitRequest {
                data,
                format,
                params,
                requester,
            },
            state.submit_timeout,
        )
        .await?;

    Ok(Json(result))
}

fn detect_format(file_name: Option<&str>, content_type: Option<&str>) -> Result<MediaFormat, ApiError> {
    if let Some(format) = file_name.and_then(MediaFormat::from_file_name) {
        return Ok(format);
    }
    content_type
        .and_then(|ct| ct.split('/').nth(1))
        .and_then(|subtype| MediaFormat::from_str(subtype).ok())
        .ok_or_else(|| {
            ApiError::UnsupportedFormat(
                file_name
                    .or(content_type)
                    .unwrap_or("unnamed upload")
                    .to_string(),
            )
        })
}

fn apply_field(
    params: &mut TranscribeParams,
    requester: &mut serde_json::Value,
    name: &str,
    value: &str,
) -> Result<(), ApiError> {
    match name {
        "model" => params.model = value.to_string(),
        "language" => params.language = value.to_string(),
        "diarize" => params.diarize = parse_flag(value)?,
        "num_speakers" => params.num_speakers = parse_count(name, value)?,
        "min_speakers" => params.min_speakers = parse_count(name, value)?,
        "max_speakers" => params.max_speakers = parse_count(name, value)?,
        "requester" => {
            *requester = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        }
        other => {
            params
                .extra
                .insert(other.to_string(), serde_json::Value::String(value.to_string()));
        }
    }
    Ok(())
}

fn parse_flag(value: &str) -> Result<bool, ApiError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ApiError::InvalidParameters(format!(
            "diarize must be a boolean, got {value:?}"
        ))),
    }
}

fn parse_count(name: &str, value: &str) -> Result<Option<u32>, ApiError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ApiError::InvalidParameters(format!("{name} must be a positive integer")))
}

/// Diarization without any speaker hint falls back to the configured bounds.
fn apply_diarize_bounds(params: &mut TranscribeParams, (min, max): (u32, u32)) {
    if params.diarize
        && params.num_speakers.is_none()
        && params.min_speakers.is_none()
        && params.max_speakers.is_none()
    {
        params.min_speakers = Some(min);
        params.max_speakers = Some(max);
    }
}

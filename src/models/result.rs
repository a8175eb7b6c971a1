use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::job::JobId;

/// One timed span of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// Output of the external transcription engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Category of a failed job attempt. Front ends map these to their own wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ErrorKind {
    ProcessingFailure,
    InputMissing,
    InvalidParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of processing exactly one job.
///
/// A success carries a payload and no error, a failure carries an error and
/// no payload. The constructors and the deserializer both enforce this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobResult")]
pub struct JobResult {
    job_id: JobId,
    status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Transcript>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<String>,
    /// Results group of the dispatcher that submitted the job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    completed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawJobResult {
    job_id: JobId,
    status: ResultStatus,
    #[serde(default)]
    payload: Option<Transcript>,
    #[serde(default)]
    error: Option<JobError>,
    #[serde(default)]
    worker: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default = "Utc::now")]
    completed_at: DateTime<Utc>,
}

impl TryFrom<RawJobResult> for JobResult {
    type Error = String;

    fn try_from(raw: RawJobResult) -> Result<Self, Self::Error> {
        match (raw.status, &raw.payload, &raw.error) {
            (ResultStatus::Success, Some(_), None) | (ResultStatus::Failure, None, Some(_)) => {
                Ok(Self {
                    job_id: raw.job_id,
                    status: raw.status,
                    payload: raw.payload,
                    error: raw.error,
                    worker: raw.worker,
                    reply_to: raw.reply_to,
                    completed_at: raw.completed_at,
                })
            }
            (status, _, _) => Err(format!(
                "result for job {} with status {status} must carry exactly one of payload or error",
                raw.job_id
            )),
        }
    }
}

impl JobResult {
    pub fn success(job_id: JobId, payload: Transcript) -> Self {
        Self {
            job_id,
            status: ResultStatus::Success,
            payload: Some(payload),
            error: None,
            worker: None,
            reply_to: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(job_id: JobId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            job_id,
            status: ResultStatus::Failure,
            payload: None,
            error: Some(JobError {
                kind,
                message: message.into(),
            }),
            worker: None,
            reply_to: None,
            completed_at: Utc::now(),
        }
    }

    /// Record which consumer produced this result.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Address the result to the dispatcher whose group is `reply_to`.
    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn payload(&self) -> Option<&Transcript> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn into_outcome(self) -> Result<Transcript, JobError> {
        match (self.payload, self.error) {
            (Some(payload), _) => Ok(payload),
            (None, Some(error)) => Err(error),
            (None, None) => Err(JobError {
                kind: ErrorKind::ProcessingFailure,
                message: "result carried neither payload nor error".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_wire_shape() {
        let id = JobId::new();
        let result = JobResult::success(
            id,
            Transcript {
                text: "привет мир".to_string(),
                segments: vec![Segment {
                    start: 0.0,
                    end: 1.2,
                    text: "привет мир".to_string(),
                    speaker: None,
                }],
            },
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["payload"]["segments"][0]["end"], 1.2);
        assert!(value.get("error").is_none());
        assert!(value["payload"]["segments"][0].get("speaker").is_none());
    }

    #[test]
    fn test_failure_wire_shape() {
        let result = JobResult::failure(JobId::new(), ErrorKind::ProcessingFailure, "corrupt input");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["error"]["kind"], "ProcessingFailure");
        assert_eq!(value["error"]["message"], "corrupt input");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_rejects_payload_and_error_together() {
        let raw = json!({
            "job_id": JobId::new(),
            "status": "success",
            "payload": {"text": "x", "segments": []},
            "error": {"kind": "ProcessingFailure", "message": "boom"},
        });
        assert!(serde_json::from_value::<JobResult>(raw).is_err());
    }

    #[test]
    fn test_rejects_failure_without_error() {
        let raw = json!({"job_id": JobId::new(), "status": "failure"});
        assert!(serde_json::from_value::<JobResult>(raw).is_err());
    }

    #[test]
    fn test_accepts_speaker_labels() {
        let raw = json!({
            "job_id": JobId::new(),
            "status": "success",
            "payload": {
                "text": "hi there",
                "segments": [{"start": 0.0, "end": 0.5, "text": "hi", "speaker": "SPEAKER_00"}]
            }
        });
        let result: JobResult = serde_json::from_value(raw).unwrap();
        let payload = result.payload().unwrap();
        assert_eq!(payload.segments[0].speaker.as_deref(), Some("SPEAKER_00"));
    }

    #[test]
    fn test_reply_to_round_trips() {
        let result = JobResult::failure(JobId::new(), ErrorKind::InputMissing, "gone")
            .with_reply_to(Some("dispatch:a".to_string()));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["reply_to"], "dispatch:a");
        let back: JobResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.reply_to(), Some("dispatch:a"));

        let bare = serde_json::to_value(JobResult::failure(JobId::new(), ErrorKind::InputMissing, "gone")).unwrap();
        assert!(bare.get("reply_to").is_none());
    }

    #[test]
    fn test_into_outcome() {
        let failed = JobResult::failure(JobId::new(), ErrorKind::InputMissing, "gone");
        assert_eq!(failed.into_outcome().unwrap_err().kind, ErrorKind::InputMissing);
    }
}

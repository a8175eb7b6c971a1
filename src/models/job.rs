use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Correlation key shared by a Job and its Result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Media container formats accepted for transcription.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, IntoStaticStr, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    // Audio
    Ogg,
    Mp3,
    Wav,
    M4a,
    Flac,
    Aac,
    // Video
    Mp4,
    Mkv,
    Avi,
    Mov,
    Webm,
    Flv,
}

impl MediaFormat {
    /// Resolve the format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }

    pub fn extension(self) -> &'static str {
        self.into()
    }

    pub fn is_video(self) -> bool {
        matches!(
            self,
            Self::Mp4 | Self::Mkv | Self::Avi | Self::Mov | Self::Webm | Self::Flv
        )
    }
}

pub const PARAMS_VERSION: u32 = 1;

fn default_version() -> u32 {
    PARAMS_VERSION
}

fn default_model() -> String {
    "medium".to_string()
}

fn default_language() -> String {
    "Russian".to_string()
}

/// Worker-side configuration bag carried with every job.
///
/// Only the worker interprets these values; the queue treats them as opaque.
/// Keys the worker does not know about are kept in `extra` and round-trip
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TranscribeParams {
    #[garde(range(min = 1))]
    #[serde(default = "default_version")]
    pub version: u32,

    #[garde(length(min = 1, max = 64))]
    #[serde(default = "default_model")]
    pub model: String,

    #[garde(length(min = 1, max = 64))]
    #[serde(default = "default_language")]
    pub language: String,

    #[garde(skip)]
    #[serde(default)]
    pub diarize: bool,

    #[garde(range(min = 1, max = 20))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_speakers: Option<u32>,

    #[garde(range(min = 1, max = 20))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_speakers: Option<u32>,

    #[garde(range(min = 1, max = 20))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speakers: Option<u32>,

    #[garde(skip)]
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for TranscribeParams {
    fn default() -> Self {
        Self {
            version: PARAMS_VERSION,
            model: default_model(),
            language: default_language(),
            diarize: false,
            num_speakers: None,
            min_speakers: None,
            max_speakers: None,
            extra: BTreeMap::new(),
        }
    }
}

impl TranscribeParams {
    /// Field validation plus the cross-field speaker bounds.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())?;

        if let (Some(min), Some(max)) = (self.min_speakers, self.max_speakers) {
            if min > max {
                return Err(format!(
                    "min_speakers ({min}) must not exceed max_speakers ({max})"
                ));
            }
        }

        if let Some((key, _)) = self
            .extra
            .iter()
            .find(|(_, value)| value.is_array() || value.is_object())
        {
            return Err(format!("parameter {key} must be a scalar"));
        }

        Ok(())
    }
}

/// One unit of requested transcription work, as stored on the jobs stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub input_ref: String,
    pub parameters: TranscribeParams,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub requester_context: serde_json::Value,
    /// Results group of the submitting dispatcher. Copied onto the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_media_format_from_file_name() {
        assert_eq!(MediaFormat::from_file_name("voice.OGG"), Some(MediaFormat::Ogg));
        assert_eq!(MediaFormat::from_file_name("clip.final.mkv"), Some(MediaFormat::Mkv));
        assert_eq!(MediaFormat::from_file_name("notes.txt"), None);
        assert_eq!(MediaFormat::from_file_name("no_extension"), None);
    }

    #[test]
    fn test_media_format_extension_matches_parse() {
        for format in MediaFormat::iter() {
            assert_eq!(format.extension().parse::<MediaFormat>().unwrap(), format);
        }
        assert!(MediaFormat::Webm.is_video());
        assert!(!MediaFormat::M4a.is_video());
    }

    #[test]
    fn test_params_defaults_from_empty_mapping() {
        let params: TranscribeParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, TranscribeParams::default());
        assert_eq!(params.model, "medium");
        assert_eq!(params.language, "Russian");
    }

    #[test]
    fn test_params_keep_unknown_keys() {
        let params: TranscribeParams =
            serde_json::from_str(r#"{"model":"large-v3","beam_size":5}"#).unwrap();
        assert_eq!(params.extra.get("beam_size"), Some(&serde_json::json!(5)));

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["beam_size"], 5);
        assert_eq!(value["model"], "large-v3");
    }

    #[test]
    fn test_params_rejects_inverted_speaker_bounds() {
        let params = TranscribeParams {
            diarize: true,
            min_speakers: Some(5),
            max_speakers: Some(2),
            ..Default::default()
        };
        assert!(params.check().is_err());
    }

    #[test]
    fn test_params_rejects_empty_model() {
        let params = TranscribeParams {
            model: String::new(),
            ..Default::default()
        };
        assert!(params.check().is_err());
    }

    #[test]
    fn test_params_rejects_nested_extra() {
        let mut params = TranscribeParams::default();
        params
            .extra
            .insert("hints".to_string(), serde_json::json!(["a", "b"]));
        assert!(params.check().is_err());
    }

    #[test]
    fn test_job_id_round_trips_as_string() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }
}

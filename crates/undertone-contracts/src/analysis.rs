use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SubtextError};

/// Bound enforced by the input-collection layer on raw text.
pub const MAX_TEXT_CHARS: usize = 5000;

/// Ceiling on media files; the encoder fails loudly past this.
pub const MAX_MEDIA_BYTES: u64 = 200 * 1024 * 1024;

/// What the user handed over for one analysis cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisInput {
    Text(String),
    Media {
        path: PathBuf,
        mime_type: Option<String>,
    },
}

impl AnalysisInput {
    pub fn text(content: impl Into<String>) -> Self {
        AnalysisInput::Text(content.into())
    }

    pub fn media(path: impl Into<PathBuf>, mime_type: Option<String>) -> Self {
        AnalysisInput::Media {
            path: path.into(),
            mime_type,
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            AnalysisInput::Text(_) => Modality::Text,
            AnalysisInput::Media { .. } => Modality::Media,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Media,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Media => "media",
        }
    }
}

/// Behavioral cue categories for media timeline observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineCue {
    SpeechRate,
    Tone,
    Pause,
    Expression,
}

impl TimelineCue {
    pub const WIRE_NAMES: &'static [&'static str] = &["speech_rate", "tone", "pause", "expression"];
}

/// One timestamped observation from an audio/video input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: String,
    pub observation: String,
    #[serde(rename = "type")]
    pub cue: TimelineCue,
}

/// The structured report returned by the model, camelCase on the wire.
///
/// `key_excerpts` only accompanies text inputs and `timeline_analysis`
/// only media inputs; [`validate_result`] enforces that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub surface_meaning: String,
    pub hidden_motive: String,
    pub heartbreak_index: f64,
    pub emotional_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub euphemism_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_cues: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub better_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actionable_advice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_excerpts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_analysis: Option<Vec<TimelineEvent>>,
}

/// Check a freshly parsed result against the contract.
///
/// Missing or blank required fields and out-of-range scores reject the
/// whole result. Fields that belong to the other modality are stripped
/// and reported as warnings instead of failing the analysis.
pub fn validate_result(result: &mut AnalysisResult, modality: Modality) -> Result<Vec<String>> {
    if result.surface_meaning.trim().is_empty() {
        return Err(SubtextError::MalformedResponse(
            "surfaceMeaning is empty".to_string(),
        ));
    }
    if result.hidden_motive.trim().is_empty() {
        return Err(SubtextError::MalformedResponse(
            "hiddenMotive is empty".to_string(),
        ));
    }
    if result.emotional_tags.iter().all(|tag| tag.trim().is_empty()) {
        return Err(SubtextError::MalformedResponse(
            "emotionalTags is empty".to_string(),
        ));
    }

    ensure_score("heartbreakIndex", Some(result.heartbreak_index))?;
    ensure_score("euphemismLevel", result.euphemism_level)?;
    ensure_score("communicationScore", result.communication_score)?;

    let mut warnings = Vec::new();
    match modality {
        Modality::Text => {
            if result.timeline_analysis.take().is_some() {
                warnings.push("timeline analysis dropped for text input.".to_string());
            }
        }
        Modality::Media => {
            if result.key_excerpts.take().is_some() {
                warnings.push("key excerpts dropped for media input.".to_string());
            }
        }
    }
    Ok(warnings)
}

fn ensure_score(field: &str, value: Option<f64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(0.0..=100.0).contains(&value) {
        return Err(SubtextError::MalformedResponse(format!(
            "{field} out of range: {value}"
        )));
    }
    Ok(())
}

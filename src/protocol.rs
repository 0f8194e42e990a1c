use crate::archive::Archive;
use crate::convert::{ConversionOptions, OutputFormat};
use crate::storage::StoredFile;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

pub const NO_SHP_FILES_MESSAGE: &str = "No .shp files found in the archive";

fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Caller -> worker. Older field names (`file`, `output_format`,
/// `target_shp`) are accepted and upgraded on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    #[serde(rename = "v", default = "protocol_version")]
    pub version: u32,
    #[serde(alias = "file")]
    pub archive: Archive,
    #[serde(default, alias = "output_format")]
    pub output_format: OutputFormat,
    #[serde(default, alias = "target_shp", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub options: ConversionOptions,
}

impl ConversionRequest {
    pub fn new(archive: Archive, output_format: OutputFormat) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            archive,
            output_format,
            target: None,
            options: ConversionOptions::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_options(mut self, options: ConversionOptions) -> Self {
        self.options = options;
        self
    }

    /// The explicit target, if any. An empty string counts as unset.
    pub fn explicit_target(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub handle: StoredFile,
    pub filename: String,
}

/// Worker -> caller. Exactly one variant per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "WireResponse")]
pub enum ConversionResponse {
    Ready,
    NeedsSelection { candidates: Vec<String> },
    Success { output: OutputArtifact },
    Failure { message: String },
}

impl ConversionResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        ConversionResponse::Failure {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConversionResponse::Ready => "ready",
            ConversionResponse::NeedsSelection { .. } => "needs_selection",
            ConversionResponse::Success { .. } => "success",
            ConversionResponse::Failure { .. } => "failure",
        }
    }
}

/// The flat object that actually goes over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready: Option<bool>,
    #[serde(
        default,
        alias = "shp_file_candidates",
        skip_serializing_if = "Option::is_none"
    )]
    candidates: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<OutputArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<ConversionResponse> for WireResponse {
    fn from(value: ConversionResponse) -> Self {
        match value {
            ConversionResponse::Ready => WireResponse {
                ready: Some(true),
                ..Default::default()
            },
            ConversionResponse::NeedsSelection { candidates } => WireResponse {
                candidates: Some(candidates),
                ..Default::default()
            },
            ConversionResponse::Success { output } => WireResponse {
                output: Some(output),
                ..Default::default()
            },
            ConversionResponse::Failure { message } => WireResponse {
                error: Some(message),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireResponse> for ConversionResponse {
    type Error = EngineError;

    fn try_from(value: WireResponse) -> Result<Self> {
        let mut tags = Vec::new();
        if value.ready == Some(true) {
            tags.push("ready");
        }
        if value.candidates.is_some() {
            tags.push("candidates");
        }
        if value.output.is_some() {
            tags.push("output");
        }
        if value.error.is_some() {
            tags.push("error");
        }
        if tags.len() != 1 {
            let found = if tags.is_empty() {
                "none".to_string()
            } else {
                tags.join(", ")
            };
            return Err(EngineError::UnexpectedResponseShape(format!(
                "expected exactly one of ready/candidates/output/error, found {found}"
            )));
        }

        let response = if let Some(candidates) = value.candidates {
            ConversionResponse::NeedsSelection { candidates }
        } else if let Some(output) = value.output {
            ConversionResponse::Success { output }
        } else if let Some(message) = value.error {
            ConversionResponse::Failure { message }
        } else {
            ConversionResponse::Ready
        };
        Ok(response)
    }
}

pub fn encode_request(request: &ConversionRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

pub fn decode_request(raw: &str) -> Result<ConversionRequest> {
    let request: ConversionRequest = serde_json::from_str(raw)?;
    if request.version != PROTOCOL_VERSION {
        return Err(EngineError::UnsupportedProtocolVersion {
            found: request.version,
            expected: PROTOCOL_VERSION,
        });
    }
    Ok(request)
}

pub fn encode_response(response: &ConversionResponse) -> Result<String> {
    Ok(serde_json::to_string(response)?)
}

/// Anything that is not exactly one known tag is reported as
/// [`EngineError::UnexpectedResponseShape`].
pub fn decode_response(raw: &str) -> Result<ConversionResponse> {
    let wire: WireResponse = serde_json::from_str(raw)
        .map_err(|e| EngineError::UnexpectedResponseShape(format!("{e}: {raw}")))?;
    ConversionResponse::try_from(wire)
}

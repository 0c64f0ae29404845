use std::path::PathBuf;

use anyhow::Error;
use serde::Serialize;

pub type Result<T, E = ChatcutError> = std::result::Result<T, E>;

/// Failure taxonomy shared by every stage of a render job.
///
/// `Parse`, `Validation` and `NoMatch` are structural and always surface
/// before the first frame is rendered. `AssetFetch` is recoverable and is
/// normally absorbed by the asset layer. `Encoding` and `Cancelled` are
/// terminal for a job that has already started streaming frames.
#[derive(Debug, thiserror::Error)]
pub enum ChatcutError {
    #[error("{source_name}:{line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("no clip named '{clip_name}' in EDL (available: {available})")]
    NoMatch {
        clip_name: String,
        available: String,
    },

    #[error("failed to fetch asset {url}: {reason}")]
    AssetFetch { url: String, reason: String },

    #[error("{message}")]
    Encoding {
        message: String,
        stderr_tail: String,
    },

    #[error("render cancelled")]
    Cancelled,

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChatcutError {
    pub fn parse(source_name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            stderr_tail: String::new(),
        }
    }

    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NoMatch { .. } => "NO_MATCH",
            Self::AssetFetch { .. } => "ASSET_FETCH_ERROR",
            Self::Encoding { .. } => "ENCODING_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Io { .. } => "IO_ERROR",
        }
    }

    /// Process exit code used by the CLI. Structural errors share one code so
    /// scripts can tell "fix your inputs" apart from "the encoder died".
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. } | Self::Validation(_) | Self::NoMatch { .. } => 2,
            Self::AssetFetch { .. } | Self::Io { .. } => 3,
            Self::Encoding { .. } => 4,
            Self::Cancelled => 130,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            Self::Encoding { stderr_tail, .. } if !stderr_tail.is_empty() => {
                Some(serde_json::json!({ "stderr_tail": stderr_tail }))
            }
            Self::NoMatch { clip_name, .. } => Some(serde_json::json!({ "clip_name": clip_name })),
            Self::Parse { source_name, line, .. } => {
                Some(serde_json::json!({ "source": source_name, "line": line }))
            }
            _ => None,
        };
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code().to_owned(),
                message: self.to_string(),
                details,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub fn find_chatcut_error(error: &Error) -> Option<&ChatcutError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ChatcutError>())
}

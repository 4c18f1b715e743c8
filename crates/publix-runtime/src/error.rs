//! Engine error type and its coarse taxonomy.

use publix_kernel::{ComponentId, StoreError, StudyId};

use crate::id_token::IdTokenError;
use crate::result_files::FileStoreError;

/// Coarse classification every [`PublixError`] folds into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    UnsupportedMediaType,
    InternalServerError,
}

#[derive(Debug, thiserror::Error)]
pub enum PublixError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("component {component_id} of study {study_id} can't be reloaded")]
    ForbiddenReload {
        study_id: StudyId,
        component_id: ComponentId,
    },
    #[error(
        "study {study_id} allows only linear flow: position {requested} requested after position {current}"
    )]
    ForbiddenNonLinearFlow {
        study_id: StudyId,
        requested: usize,
        current: usize,
    },
    #[error("study {0} can be done only once")]
    StudyCanBeDoneOnlyOnce(StudyId),
    #[error("{0}")]
    NotFound(String),
    #[error("study {0} has no active components")]
    NoActiveComponents(StudyId),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("result data of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("result file uploads are disabled")]
    UploadsDisabled,
    #[error("file of {size} bytes exceeds the limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("upload quota of {limit} bytes per run exceeded ({used} bytes already stored)")]
    QuotaExceeded { used: u64, limit: u64 },
    #[error("bad filename '{0}'")]
    BadFilename(String),
    #[error(transparent)]
    Token(#[from] IdTokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PublixError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Forbidden(_)
            | Self::ForbiddenReload { .. }
            | Self::ForbiddenNonLinearFlow { .. }
            | Self::StudyCanBeDoneOnlyOnce(_)
            | Self::PayloadTooLarge { .. }
            | Self::UploadsDisabled
            | Self::FileTooLarge { .. }
            | Self::QuotaExceeded { .. }
            | Self::BadFilename(_)
            | Self::Token(_) => ErrorKind::Forbidden,
            Self::NotFound(_) | Self::NoActiveComponents(_) => ErrorKind::NotFound,
            Self::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            Self::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Store(_) | Self::Internal(_) => ErrorKind::InternalServerError,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_argument",
            Self::Forbidden(_) => "forbidden",
            Self::ForbiddenReload { .. } => "forbidden_reload",
            Self::ForbiddenNonLinearFlow { .. } => "forbidden_non_linear_flow",
            Self::StudyCanBeDoneOnlyOnce(_) => "study_can_be_done_only_once",
            Self::NotFound(_) => "not_found",
            Self::NoActiveComponents(_) => "no_active_components",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UploadsDisabled => "uploads_disabled",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::BadFilename(_) => "bad_filename",
            Self::Token(IdTokenError::Signature) => "token_signature",
            Self::Token(_) => "token_malformed",
            Self::Store(StoreError::NotFound { .. }) => "not_found",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }

    /// Failures after which the participant is sent to a graceful end
    /// instead of an error page.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            Self::ForbiddenReload { .. } | Self::ForbiddenNonLinearFlow { .. }
        )
    }
}

impl From<FileStoreError> for PublixError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::BadFilename(name) => Self::BadFilename(name),
            FileStoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

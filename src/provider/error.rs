//! Provider error classification.

use thiserror::Error;

/// Coarse classification of a provider failure, derived from its error code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// The named resource does not exist (or is not visible yet).
    NotFound,
    /// A create call lost a race with a concurrent creator.
    AlreadyExists,
    /// The caller lacks permission, or a trust relationship rejects it.
    AccessDenied,
    /// The backend credentials themselves are malformed or rejected.
    InvalidCredentials,
    /// The target is not reachable through the service yet.
    Unavailable,
    /// The provider rate-limited the request.
    Throttled,
    /// Anything else, including local transport failures.
    Other,
}

impl ProviderErrorKind {
    /// Classifies a provider error code such as `NoSuchEntity`.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "NoSuchEntity"
            | "InvalidGroup.NotFound"
            | "InvalidPlacementGroup.Unknown"
            | "InvalidAMIID.NotFound"
            | "InvalidAMIID.Malformed"
            | "InvalidAMIID.Unavailable"
            | "InvalidSubnetID.NotFound"
            | "InvalidInstanceID.NotFound"
            | "InvalidInstanceID.Malformed"
            | "RepositoryNotFoundException"
            | "ImageNotFoundException"
            | "NoSuchBucket"
            | "NoSuchKey"
            | "404" => Self::NotFound,
            "EntityAlreadyExists"
            | "InvalidGroup.Duplicate"
            | "InvalidPlacementGroup.Duplicate"
            | "RepositoryAlreadyExistsException"
            | "BucketAlreadyOwnedByYou" => Self::AlreadyExists,
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "403" => {
                Self::AccessDenied
            }
            "InvalidClientTokenId"
            | "SignatureDoesNotMatch"
            | "UnrecognizedClientException"
            | "AuthFailure"
            | "ExpiredToken"
            | "ExpiredTokenException" => Self::InvalidCredentials,
            "InvalidInstanceId" | "InvocationDoesNotExist" => Self::Unavailable,
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => Self::Throttled,
            _ => Self::Other,
        }
    }
}

/// Failure reported by a provider capability call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Classification used by retry and diagnosis logic.
    pub kind: ProviderErrorKind,
    /// Raw provider error code (for example `InvalidGroup.NotFound`).
    pub code: String,
    /// Provider supplied message.
    pub message: String,
}

impl ProviderError {
    /// Builds an error from a provider code, classifying it.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let provider_code = code.into();
        Self {
            kind: ProviderErrorKind::from_code(&provider_code),
            code: provider_code,
            message: message.into(),
        }
    }

    /// Builds an error with an explicit classification.
    #[must_use]
    pub fn with_kind(
        kind: ProviderErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Builds an error for failures that never reached the provider.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::with_kind(ProviderErrorKind::Other, "Transport", message)
    }

    /// Returns `true` when the resource was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::NotFound)
    }

    /// Returns `true` when a concurrent creator already made the resource.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::AlreadyExists)
    }
}

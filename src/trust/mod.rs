//! Cross-account trust verification.
//!
//! [`TrustVerifier::verify`] keeps assuming the caller-supplied role until
//! it works, the attempt budget is spent, or the failure is diagnosed as
//! permanent. A role that was just created by a trust template may take a
//! while to become assumable, so "not found" is retried. The very first
//! "access denied" is read the same way; later ones mean the trust policy
//! does not name us.

mod session;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::provider::{AssumeRoleRequest, ProviderError, ProviderErrorKind, StsApi, is_account_id};
use crate::retry::RetryPolicy;

pub use session::{
    Clock, InMemorySessionStore, SessionError, SessionId, SessionStore, SystemClock, TrustSession,
};

/// Lifetime requested for verified sessions, in seconds.
pub const SESSION_DURATION_SECS: u32 = 3_600;

/// Prefix of the session names used while verifying.
pub const SESSION_NAME_PREFIX: &str = "skiff-verify-";

/// Role named by plain name or full ARN.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoleRef {
    /// Role name inside the target account.
    Name(String),
    /// Full role ARN.
    Arn(String),
}

impl RoleRef {
    /// Interprets `value` as an ARN when it starts with `arn:`, otherwise as
    /// a role name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("arn:") {
            Self::Arn(trimmed.to_owned())
        } else {
            Self::Name(trimmed.to_owned())
        }
    }

    /// Role ARN within `account_id`.
    #[must_use]
    pub fn arn(&self, account_id: &str) -> String {
        match self {
            Self::Name(name) => format!("arn:aws:iam::{account_id}:role/{name}"),
            Self::Arn(arn) => arn.clone(),
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Arn(arn) => f.write_str(arn),
        }
    }
}

/// What one failed assume-role attempt means.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Diagnosis {
    /// The role does not exist or is not visible yet.
    RoleMissing,
    /// The role exists but its trust policy rejects the caller.
    TrustMismatch,
    /// The caller's own credentials are broken.
    InvalidCredentials,
    /// The broker is rate-limiting or briefly unavailable.
    Transient,
    /// Anything else.
    Other,
}

impl Diagnosis {
    /// Returns `true` when another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RoleMissing | Self::Transient)
    }
}

/// Classifies a failure of the 1-based `attempt`.
#[must_use]
pub const fn diagnose(kind: ProviderErrorKind, attempt: u32) -> Diagnosis {
    match kind {
        ProviderErrorKind::NotFound => Diagnosis::RoleMissing,
        ProviderErrorKind::AccessDenied if attempt <= 1 => Diagnosis::RoleMissing,
        ProviderErrorKind::AccessDenied => Diagnosis::TrustMismatch,
        ProviderErrorKind::InvalidCredentials => Diagnosis::InvalidCredentials,
        ProviderErrorKind::Throttled | ProviderErrorKind::Unavailable => Diagnosis::Transient,
        ProviderErrorKind::AlreadyExists | ProviderErrorKind::Other => Diagnosis::Other,
    }
}

/// Errors raised while verifying trust.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The account identifier is malformed.
    #[error("account identifier `{0}` must be exactly 12 digits")]
    InvalidAccount(String),
    /// The role never became assumable.
    #[error("role {role_arn} could not be assumed after {attempts} attempts.\n{remediation}")]
    RoleNotFound {
        /// Role that was tried.
        role_arn: String,
        /// Attempts made.
        attempts: u32,
        /// Steps that create the role.
        remediation: String,
    },
    /// The role exists but does not trust the caller.
    #[error(
        "role {role_arn} exists but its trust policy does not allow {actual} to assume it; \
         expected trusted principal {expected}. Update the role trust policy and retry"
    )]
    TrustMismatch {
        /// Role that was tried.
        role_arn: String,
        /// Principal the role should trust.
        expected: String,
        /// Identity actually making the call.
        actual: String,
    },
    /// The service's own credentials are invalid.
    #[error("the deployment service credentials were rejected: {0}")]
    InvalidCredentials(#[source] ProviderError),
    /// The broker kept failing transiently until the budget ran out.
    #[error("role {role_arn} could not be assumed after {attempts} attempts: {source}")]
    Exhausted {
        /// Role that was tried.
        role_arn: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: ProviderError,
    },
    /// Any other broker failure.
    #[error("failed to assume role {role_arn}: {source}")]
    Provider {
        /// Role that was tried.
        role_arn: String,
        /// Underlying failure.
        #[source]
        source: ProviderError,
    },
}

/// Settings shared by every verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustSettings {
    /// Region recorded in issued sessions.
    pub region: String,
    /// External identifier required by the role's trust policy.
    pub external_id: Option<String>,
    /// Principal the role is expected to trust, shown in mismatch reports.
    pub trust_principal_arn: Option<String>,
    /// Attempt budget.
    pub policy: RetryPolicy,
}

impl TrustSettings {
    /// Default budget: 24 attempts five seconds apart.
    pub const DEFAULT_POLICY: RetryPolicy = RetryPolicy::new(24, Duration::from_secs(5));

    /// Settings for `region` with no external identifier.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            external_id: None,
            trust_principal_arn: None,
            policy: Self::DEFAULT_POLICY,
        }
    }
}

/// Verifies cross-account trust against an identity broker.
#[derive(Debug)]
pub struct TrustVerifier<'p, S: ?Sized> {
    api: &'p S,
    settings: TrustSettings,
}

impl<'p, S: StsApi + ?Sized> TrustVerifier<'p, S> {
    /// Creates a verifier.
    #[must_use]
    pub const fn new(api: &'p S, settings: TrustSettings) -> Self {
        Self { api, settings }
    }

    /// Assumes `role` in `account_id` until it works and returns the
    /// resulting session.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] when the account is malformed, the role stays
    /// missing for the whole budget, the trust policy rejects the caller,
    /// or the service's own credentials are invalid.
    pub async fn verify(
        &self,
        account_id: &str,
        role: &RoleRef,
    ) -> Result<TrustSession, TrustError> {
        let account = account_id.trim();
        if !is_account_id(account) {
            return Err(TrustError::InvalidAccount(account.to_owned()));
        }
        let role_arn = role.arn(account);
        let request = AssumeRoleRequest {
            role_arn: role_arn.clone(),
            session_name: session_name(),
            external_id: self.settings.external_id.clone(),
            duration_secs: SESSION_DURATION_SECS,
        };
        let policy = self.settings.policy;

        for attempt in 1..=policy.attempts() {
            let err = match self.api.assume_role(&request).await {
                Ok(credentials) => {
                    info!(role_arn = %role_arn, attempt, "trust relationship verified");
                    return Ok(TrustSession {
                        access_key_id: credentials.access_key_id,
                        secret_access_key: credentials.secret_access_key,
                        session_token: credentials.session_token,
                        expires_at: credentials.expiration,
                        account_id: account.to_owned(),
                        role_arn,
                        region: self.settings.region.clone(),
                    });
                }
                Err(err) => err,
            };

            let diagnosis = diagnose(err.kind, attempt);
            if !diagnosis.is_retryable() {
                return Err(self.fatal(diagnosis, role_arn, err).await);
            }
            if attempt == policy.attempts() {
                return Err(exhausted(diagnosis, account, role, role_arn, attempt, err));
            }
            warn!(
                role_arn = %role_arn,
                attempt,
                code = %err.code,
                "role not assumable yet; retrying"
            );
            tokio::time::sleep(policy.delay()).await;
        }
        // The loop always returns on its final attempt.
        Err(TrustError::RoleNotFound {
            remediation: role_remediation(account, role),
            role_arn,
            attempts: policy.attempts(),
        })
    }

    async fn fatal(
        &self,
        diagnosis: Diagnosis,
        role_arn: String,
        source: ProviderError,
    ) -> TrustError {
        match diagnosis {
            Diagnosis::TrustMismatch => {
                let (expected, actual) = self.trust_identities().await;
                TrustError::TrustMismatch {
                    role_arn,
                    expected,
                    actual,
                }
            }
            Diagnosis::InvalidCredentials => TrustError::InvalidCredentials(source),
            _ => TrustError::Provider { role_arn, source },
        }
    }

    /// Expected and actual trusted identities for mismatch reports.
    async fn trust_identities(&self) -> (String, String) {
        match self.api.caller_identity().await {
            Ok(caller) => {
                let expected = self
                    .settings
                    .trust_principal_arn
                    .clone()
                    .unwrap_or_else(|| format!("arn:aws:iam::{}:root", caller.account));
                (expected, caller.arn)
            }
            Err(err) => {
                warn!(error = %err, "could not read caller identity");
                (
                    self.settings
                        .trust_principal_arn
                        .clone()
                        .unwrap_or_else(|| String::from("the deployment service account")),
                    String::from("unable to determine"),
                )
            }
        }
    }
}

fn exhausted(
    diagnosis: Diagnosis,
    account: &str,
    role: &RoleRef,
    role_arn: String,
    attempts: u32,
    source: ProviderError,
) -> TrustError {
    if diagnosis == Diagnosis::RoleMissing {
        TrustError::RoleNotFound {
            role_arn,
            attempts,
            remediation: role_remediation(account, role),
        }
    } else {
        TrustError::Exhausted {
            role_arn,
            attempts,
            source,
        }
    }
}

fn role_remediation(account: &str, role: &RoleRef) -> String {
    format!(
        "To fix this:\n  \
         1. Sign in to account {account} and deploy the skiff trust template.\n  \
         2. Confirm that role {role} exists and trusts the deployment service.\n  \
         3. Wait a minute for the role to propagate, then verify again."
    )
}

fn session_name() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{SESSION_NAME_PREFIX}{suffix}")
}

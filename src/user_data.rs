//! Boot script resolution for deployments.
//!
//! A boot script reaches the launcher either inline or from a local file.
//! Both sources go through the same checks here so the CLI and library
//! callers agree on what counts as a usable payload.

use camino::Utf8Path;
use thiserror::Error;

use crate::local_fs::open_parent;

/// Errors raised while resolving user data.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum UserDataError {
    /// Both an inline payload and a file were supplied.
    #[error("user data cannot be provided both inline and via file")]
    BothProvided,
    /// The inline payload is blank.
    #[error("user data must not be empty")]
    InlineEmpty,
    /// The file path is blank.
    #[error("user data file path must not be empty")]
    FilePathEmpty,
    /// The file exists but holds only whitespace.
    #[error("user data file `{path}` must not be empty")]
    FileEmpty {
        /// Expanded path.
        path: String,
    },
    /// The file could not be read.
    #[error("failed to read user data file `{path}`: {message}")]
    FileRead {
        /// Expanded path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Returns the payload from `inline` or `file`, or `None` when neither is
/// set. The returned payload is not trimmed.
///
/// # Errors
///
/// Returns [`UserDataError`] when both sources are given, a source is blank,
/// or the file cannot be read.
pub fn resolve_user_data(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, UserDataError> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(UserDataError::BothProvided),
        (Some(payload), None) => {
            if payload.trim().is_empty() {
                return Err(UserDataError::InlineEmpty);
            }
            Ok(Some(payload.to_owned()))
        }
        (None, Some(path)) => read_file(path).map(Some),
        (None, None) => Ok(None),
    }
}

fn read_file(path: &str) -> Result<String, UserDataError> {
    if path.trim().is_empty() {
        return Err(UserDataError::FilePathEmpty);
    }
    let expanded = expand_tilde(path.trim());
    let content = read_to_string_ambient(&expanded).map_err(|message| UserDataError::FileRead {
        path: expanded.clone(),
        message,
    })?;
    if content.trim().is_empty() {
        return Err(UserDataError::FileEmpty { path: expanded });
    }
    Ok(content)
}

/// Replaces a leading `~/` with the value of `HOME`.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let (dir, name) = open_parent(Utf8Path::new(path)).map_err(|err| err.to_string())?;
    dir.read_to_string(&name).map_err(|err| err.to_string())
}

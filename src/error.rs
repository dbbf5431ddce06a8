//! Error types for volumetric playback.
//!
//! Every fallible operation in the crate returns [`PlayerError`]. Variants map
//! onto the failure classes a player has to react to differently:
//!
//! - **InvalidState**: the caller broke the single-mutation-in-flight rule of a
//!   source buffer. This is a programming error and is surfaced synchronously.
//! - **QuotaExceeded**: the frame cache hit its configured byte or frame limit.
//! - **SeekTimeout**: a seek target never became jointly playable in time. The
//!   caller may retry.
//! - **Configuration**: the manifest declares video and mesh representations
//!   that cannot be paired. Fatal for the playback session.
//! - **Decode / Container / Decryption**: a malformed payload. Recovered
//!   locally by dropping the offending sample.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use holosync::PlayerError;
//! use std::time::Duration;
//!
//! let error = PlayerError::SeekTimeout { time: 3.0, timeout: Duration::from_secs(5) };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::playback::PlaybackState;

/// Result type alias for player operations.
pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

/// Main error type for player operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlayerError {
    #[error("Invalid state: {operation} cannot be called while an update is in progress")]
    InvalidState { operation: String },

    #[error("Quota exceeded for {resource}: {actual} >= {limit}")]
    QuotaExceeded { resource: String, limit: u64, actual: u64 },

    #[error("Seek to {time}s did not become playable within {timeout:?}")]
    SeekTimeout { time: f64, timeout: Duration },

    #[error("Time {time}s is not playable")]
    Unplayable { time: f64 },

    #[error("Request for {time}s was superseded by a newer request")]
    Superseded { time: f64 },

    #[error("Representation mismatch: {reason}")]
    Configuration { reason: String },

    #[error("Geometry decode failed in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("Container parse error in {context}: {details}")]
    Container { context: String, details: String },

    #[error("Sample decryption failed: {details}")]
    Decryption { details: String },

    #[error("Cannot transition from {from:?} to {to:?}")]
    InvalidTransition { from: PlaybackState, to: PlaybackState },

    #[error("Invalid player configuration: {details}")]
    Config {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collaborator call failed: {operation}")]
    Collaborator {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PlayerError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlayerError::InvalidState { .. } => true,
            PlayerError::QuotaExceeded { .. } => true,
            PlayerError::SeekTimeout { .. } => true,
            PlayerError::Unplayable { .. } => true,
            PlayerError::Superseded { .. } => false,
            PlayerError::Configuration { .. } => false,
            PlayerError::Decode { .. } => false,
            PlayerError::Container { .. } => false,
            PlayerError::Decryption { .. } => false,
            PlayerError::InvalidTransition { .. } => false,
            PlayerError::Config { .. } => false,
            PlayerError::File { .. } => false,
            PlayerError::Collaborator { .. } => true,
        }
    }

    /// Returns whether this error ends the playback session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlayerError::Configuration { .. } | PlayerError::InvalidTransition { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            PlayerError::InvalidState { .. } => vec![
                "Wait for the update-end event before appending again",
                "Call drain() to complete the in-flight update",
            ],
            PlayerError::QuotaExceeded { .. } => vec![
                "Remove frames behind the playback position",
                "Raise max_frames or max_buffer_bytes in the buffer configuration",
            ],
            PlayerError::SeekTimeout { .. } => vec![
                "Retry the seek once more segments have been appended",
                "Increase the seek timeout",
                "Check that the mesh track is being fetched",
            ],
            PlayerError::Unplayable { .. } => vec![
                "Seek to a time inside the buffered ranges",
                "Wait for the streaming client to fetch the target segment",
            ],
            PlayerError::Superseded { .. } => vec!["No action needed, a newer request is active"],
            PlayerError::Configuration { .. } => vec![
                "Ensure every video representation id ends with a mesh representation id",
                "Republish the manifest with matching frame rates",
            ],
            PlayerError::Decode { .. } => vec![
                "Verify the geometry payload version",
                "Check the segment was not truncated in transit",
            ],
            PlayerError::Container { .. } => vec![
                "Verify the segment is fragmented ISO-BMFF",
                "Append the initialization segment before media segments",
            ],
            PlayerError::Decryption { .. } => vec![
                "Check the content key matches the stream",
                "Verify the per-sample initialization vectors",
            ],
            PlayerError::InvalidTransition { .. } => vec![
                "Create a new playback session after a failure",
                "Call reset() before reusing the state machine",
            ],
            PlayerError::Config { .. } | PlayerError::File { .. } => vec![
                "Check the configuration file exists and is valid YAML",
                "Compare field names with PlayerConfig",
            ],
            PlayerError::Collaborator { .. } => vec![
                "Check the media element and streaming client are attached",
                "Retry the operation",
            ],
        }
    }

    /// Helper constructor for single-writer violations.
    pub fn invalid_state(operation: impl Into<String>) -> Self {
        PlayerError::InvalidState { operation: operation.into() }
    }

    /// Helper constructor for quota breaches.
    pub fn quota_exceeded(resource: impl Into<String>, limit: u64, actual: u64) -> Self {
        PlayerError::QuotaExceeded { resource: resource.into(), limit, actual }
    }

    /// Helper constructor for representation mismatches.
    pub fn configuration(reason: impl Into<String>) -> Self {
        PlayerError::Configuration { reason: reason.into() }
    }

    /// Helper constructor for payload decode failures.
    pub fn decode(context: impl Into<String>, details: impl Into<String>) -> Self {
        PlayerError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for container parse failures.
    pub fn container(context: impl Into<String>, details: impl Into<String>) -> Self {
        PlayerError::Container { context: context.into(), details: details.into() }
    }

    /// Helper constructor for invalid configuration values.
    pub fn config(details: impl Into<String>) -> Self {
        PlayerError::Config { details: details.into(), source: None }
    }

    /// Helper constructor for failed collaborator calls.
    pub fn collaborator(operation: impl Into<String>) -> Self {
        PlayerError::Collaborator { operation: operation.into(), source: None }
    }
}

impl From<std::io::Error> for PlayerError {
    fn from(err: std::io::Error) -> Self {
        PlayerError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_yaml_ng::Error> for PlayerError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        PlayerError::Config { details: err.to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_carry_their_context(
                operation in "\\w+",
                resource in "\\w+",
                limit in 1u64..1_000_000u64,
                details in "[a-z ]{1,40}",
                time in 0.0f64..10_000.0f64,
            ) {
                let state = PlayerError::invalid_state(operation.clone());
                prop_assert!(state.to_string().contains(&operation));

                let quota = PlayerError::quota_exceeded(resource.clone(), limit, limit + 1);
                let quota_msg = quota.to_string();
                prop_assert!(quota_msg.contains(&resource));
                prop_assert!(quota_msg.contains(&limit.to_string()));

                let decode = PlayerError::decode("payload", details.clone());
                prop_assert!(decode.to_string().contains(&details));

                let timeout = PlayerError::SeekTimeout { time, timeout: Duration::from_millis(5000) };
                prop_assert!(!timeout.to_string().is_empty());
            }
        }
    }

    #[test]
    fn classification_matches_error_taxonomy() {
        assert!(PlayerError::invalid_state("append").is_retryable());
        assert!(PlayerError::SeekTimeout { time: 1.0, timeout: Duration::from_secs(5) }.is_retryable());
        assert!(!PlayerError::configuration("no mesh for 1080p-30fps").is_retryable());
        assert!(PlayerError::configuration("no mesh for 1080p-30fps").is_fatal());
        assert!(!PlayerError::decode("payload", "bad magic").is_fatal());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            PlayerError::invalid_state("append"),
            PlayerError::quota_exceeded("frames", 300, 300),
            PlayerError::Unplayable { time: 2.0 },
            PlayerError::Superseded { time: 2.0 },
            PlayerError::configuration("x"),
            PlayerError::decode("a", "b"),
            PlayerError::container("a", "b"),
            PlayerError::Decryption { details: "x".to_string() },
            PlayerError::InvalidTransition { from: PlaybackState::Failed, to: PlaybackState::Playing },
            PlayerError::config("x"),
            PlayerError::collaborator("play"),
        ];
        for error in errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error:?}");
        }
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<PlayerError>();
    }

    #[test]
    fn io_and_yaml_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing config");
        let converted: PlayerError = io_err.into();
        assert!(matches!(converted, PlayerError::File { .. }));

        let yaml_err = serde_yaml_ng::from_str::<u32>("not: [a number").unwrap_err();
        let converted: PlayerError = yaml_err.into();
        assert!(matches!(converted, PlayerError::Config { source: Some(_), .. }));
    }
}

//! Error types for the ekstest harness
//!
//! Errors are structured so that the persisted cluster-state record can
//! explain any failure on its own. Each variant maps to one behaviourally
//! distinct kind (see [`ErrorKind`]) which decides whether the pipeline
//! retries, rolls back, tolerates, or surfaces the failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Provider error codes that mean the resource is already gone
const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "NoSuchBucket",
    "ResourceNotFoundException",
    "InvalidGroup.NotFound",
    "InvalidGroupId.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidPermission.NotFound",
    "InvalidInstanceID.NotFound",
    "LoadBalancerNotFound",
    "TargetGroupNotFound",
    "ListenerNotFound",
];

/// Provider error codes raised when another resource still references the target
const DEPENDENCY_CODES: &[&str] = &[
    "DependencyViolation",
    "ResourceInUse",
    "ResourceInUseException",
    "OperationAborted",
    "DeleteConflict",
];

/// Provider error codes worth retrying within a step deadline
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalError",
    "InternalFailure",
    "ServerException",
    "RequestTimeout",
];

/// Behaviourally distinct error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller fault; surfaced immediately, no rollback
    InvalidConfig,
    /// A required executable could not be found or installed
    MissingBinary,
    /// Network, throttling or eventual-consistency failure
    CloudTransient,
    /// A provider resource reached a failed terminal status
    CloudTerminal,
    /// The resource does not exist
    NotFound,
    /// Another resource still depends on the target
    DependencyViolation,
    /// A probe observed a result outside its budget
    ProbeAssertion,
    /// The run was stopped by the user
    Cancelled,
    /// A deadline expired before the operation converged
    Timeout,
    /// A subprocess failed or could not be spawned
    Command,
    /// Local I/O failed
    Io,
    /// A document could not be encoded or decoded
    Serialization,
    /// One or more teardown steps failed
    Teardown,
    /// Any other failure
    Internal,
}

impl ErrorKind {
    /// Kebab-case name used in logs and the state record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid-config",
            Self::MissingBinary => "missing-binary",
            Self::CloudTransient => "cloud-transient",
            Self::CloudTerminal => "cloud-terminal",
            Self::NotFound => "not-found",
            Self::DependencyViolation => "dependency-violation",
            Self::ProbeAssertion => "probe-assertion",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Command => "command",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Teardown => "teardown",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for ekstest operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value
    #[error("invalid config [{field}]: {message}")]
    InvalidConfig {
        /// Field that failed validation (kebab-case key)
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Required executable is unavailable
    #[error("missing binary {name}: {message}")]
    MissingBinary {
        /// Binary name (kubectl, aws-iam-authenticator, ...)
        name: String,
        /// Why it could not be used
        message: String,
    },

    /// Retryable provider failure
    #[error("cloud transient error [{service}/{code}]: {message}")]
    CloudTransient {
        /// Provider service (iam, eks, ec2, ...)
        service: String,
        /// Provider error code
        code: String,
        /// Provider message
        message: String,
    },

    /// Provider resource reached a failed terminal status
    #[error("cloud terminal error for {resource} (status {status}): {message}")]
    CloudTerminal {
        /// Logical resource name
        resource: String,
        /// Last observed status
        status: String,
        /// Description of what failed
        message: String,
    },

    /// Resource does not exist
    #[error("{resource} not found: {message}")]
    NotFound {
        /// Logical resource name
        resource: String,
        /// Provider message
        message: String,
    },

    /// Resource is still referenced by another resource
    #[error("dependency violation on {resource}: {message}")]
    DependencyViolation {
        /// Logical resource name
        resource: String,
        /// Provider message
        message: String,
    },

    /// Probe result outside its budget
    #[error("probe assertion failed [{probe}]: {message}")]
    ProbeAssertion {
        /// Probe name (correctness, throughput, metrics)
        probe: String,
        /// What was observed versus expected
        message: String,
    },

    /// User-initiated stop
    #[error("cancelled during {operation}")]
    Cancelled {
        /// Operation that observed the stop signal
        operation: String,
    },

    /// Deadline expired
    #[error("{operation} timed out after {elapsed:?}{}", last_error_suffix(.last_error))]
    Timeout {
        /// Operation that was polling
        operation: String,
        /// Time spent before giving up
        elapsed: Duration,
        /// Last error observed while polling
        last_error: Option<String>,
    },

    /// Subprocess failure
    #[error("command failed: {command} - {message}")]
    Command {
        /// The command line that failed
        command: String,
        /// Truncated output or spawn error
        message: String,
    },

    /// Local I/O failure
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being read or written
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding failure
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Aggregated teardown failures; every step was attempted
    #[error("teardown failed: {}", .errors.join(", "))]
    Teardown {
        /// One message per failed step, in execution order
        errors: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

impl Error {
    /// Create an invalid-config error for a field
    pub fn invalid_config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-binary error
    pub fn missing_binary(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MissingBinary {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Classify a provider failure by its structured error code
    ///
    /// Falls back to matching the message when the code is empty or unknown,
    /// since some provider responses only carry the condition in text.
    pub fn from_provider(
        service: impl Into<String>,
        resource: impl Into<String>,
        code: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        let service = service.into();
        let resource = resource.into();
        let code = code.into();
        let message = msg.into();

        if NOT_FOUND_CODES.contains(&code.as_str()) || message_says_not_found(&message) {
            return Self::NotFound { resource, message };
        }
        if DEPENDENCY_CODES.contains(&code.as_str())
            || message.contains("DependencyViolation")
            || message.contains("OperationAborted")
        {
            return Self::DependencyViolation { resource, message };
        }
        if TRANSIENT_CODES.contains(&code.as_str()) || code.is_empty() {
            return Self::CloudTransient {
                service,
                code: if code.is_empty() {
                    UNKNOWN_CONTEXT.to_string()
                } else {
                    code
                },
                message,
            };
        }
        Self::CloudTerminal {
            resource,
            status: code,
            message,
        }
    }

    /// Create a transient provider error
    pub fn cloud_transient(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CloudTransient {
            service: service.into(),
            code: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a terminal provider error for a resource in a failed status
    pub fn cloud_terminal(
        resource: impl Into<String>,
        status: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::CloudTerminal {
            resource: resource.into(),
            status: status.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency-violation error
    pub fn dependency_violation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DependencyViolation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a probe-assertion error
    pub fn probe_assertion(probe: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProbeAssertion {
            probe: probe.into(),
            message: msg.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(
        operation: impl Into<String>,
        elapsed: Duration,
        last_error: Option<String>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
            last_error,
        }
    }

    /// Create a subprocess error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Wrap an I/O error with what was being accessed
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with a specific context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Combine teardown failures; `None` when every step succeeded
    pub fn teardown(errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        Some(Self::Teardown {
            errors: errors.iter().map(|e| e.to_string()).collect(),
        })
    }

    /// The behavioural kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::MissingBinary { .. } => ErrorKind::MissingBinary,
            Self::CloudTransient { .. } => ErrorKind::CloudTransient,
            Self::CloudTerminal { .. } => ErrorKind::CloudTerminal,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DependencyViolation { .. } => ErrorKind::DependencyViolation,
            Self::ProbeAssertion { .. } => ErrorKind::ProbeAssertion,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Command { .. } => ErrorKind::Command,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Teardown { .. } => ErrorKind::Teardown,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if the poll kernel should keep trying
    ///
    /// Subprocess failures and not-found replies are retryable because both
    /// the provider and the cluster API are eventually consistent right after
    /// a create. Delete paths check [`Error::is_not_found`] before polling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CloudTransient { .. } | Self::Command { .. } | Self::NotFound { .. }
        )
    }

    /// Returns true if the resource is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if another resource still holds a reference
    pub fn is_dependency_violation(&self) -> bool {
        matches!(self, Self::DependencyViolation { .. })
    }

    /// Returns true if the run was stopped by the user
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn message_says_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("no cluster found for name")
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // ==========================================================================
    // Provider classification
    // ==========================================================================

    #[rstest]
    #[case::iam_missing("NoSuchEntity", "role not there", ErrorKind::NotFound)]
    #[case::sg_missing("InvalidGroup.NotFound", "group gone", ErrorKind::NotFound)]
    #[case::sg_in_use("DependencyViolation", "has a dependent object", ErrorKind::DependencyViolation)]
    #[case::aborted("OperationAborted", "conflicting operation", ErrorKind::DependencyViolation)]
    #[case::throttled("Throttling", "Rate exceeded", ErrorKind::CloudTransient)]
    #[case::unknown_code("", "connection reset", ErrorKind::CloudTransient)]
    #[case::validation("ValidationError", "bad template", ErrorKind::CloudTerminal)]
    fn test_provider_codes_map_to_kinds(
        #[case] code: &str,
        #[case] message: &str,
        #[case] expected: ErrorKind,
    ) {
        let err = Error::from_provider("ec2", "sg", code, message);
        assert_eq!(err.kind(), expected);
    }

    /// Story: CloudFormation reports a deleted stack with a generic
    /// ValidationError code; the message is the only signal it is gone.
    #[test]
    fn story_stack_gone_detected_from_message() {
        let err = Error::from_provider(
            "cloudformation",
            "vpc-stack",
            "ValidationError",
            "Stack with id test-VPC-STACK does not exist",
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn story_string_pattern_fallback_for_dependency_violation() {
        let err = Error::from_provider(
            "ec2",
            "alb-sg",
            "Client.Unknown",
            "resource sg-123 has a dependent object (DependencyViolation)",
        );
        assert!(err.is_dependency_violation());
    }

    // ==========================================================================
    // Retryability and kinds
    // ==========================================================================

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::cloud_transient("eks", "throttled").is_retryable());
        assert!(Error::command("kubectl get nodes", "connection refused").is_retryable());
        assert!(!Error::invalid_config("region", "empty").is_retryable());
        assert!(!Error::cancelled("create-cluster").is_retryable());
        assert!(!Error::cloud_terminal("stack", "ROLLBACK_COMPLETE", "failed").is_retryable());
    }

    #[test]
    fn test_kind_names_are_kebab_case() {
        assert_eq!(
            Error::probe_assertion("throughput", "x").kind().to_string(),
            "probe-assertion"
        );
        assert_eq!(Error::cancelled("x").kind().as_str(), "cancelled");
        assert_eq!(
            Error::invalid_config("x", "y").kind().as_str(),
            "invalid-config"
        );
    }

    #[test]
    fn test_timeout_display_includes_last_error() {
        let err = Error::timeout(
            "wait-control-plane",
            Duration::from_secs(1200),
            Some("status CREATING".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("wait-control-plane"));
        assert!(msg.contains("last error: status CREATING"));
    }

    // ==========================================================================
    // Teardown aggregation
    // ==========================================================================

    #[test]
    fn test_teardown_joins_with_commas() {
        let err = Error::teardown(vec![
            Error::internal("first"),
            Error::dependency_violation("sg", "second"),
        ])
        .expect("errors were collected");
        let msg = err.to_string();
        assert!(msg.contains("first, dependency violation on sg: second"));
        assert_eq!(err.kind(), ErrorKind::Teardown);
    }

    #[test]
    fn test_teardown_empty_is_none() {
        assert!(Error::teardown(Vec::new()).is_none());
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-reviewer-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-reviewer-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-reviewer-config-3 Invalid function provider: {value}")]
    InvalidFunctionProvider { value: String },

    #[error("error-reviewer-config-4 Invalid value for {var_name}: {details}")]
    InvalidValue { var_name: String, details: String },

    #[error("error-reviewer-config-5 Remote function endpoint required for provider {provider}")]
    RemoteEndpointRequired { provider: String },
}

/// Reasons a rule is rejected when it is loaded.
///
/// A rule that produces one of these errors never reaches evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("error-reviewer-rule-1 Rule {rule_id} could not be decoded: {details}")]
    DecodeFailed { rule_id: i64, details: String },

    #[error("error-reviewer-rule-2 Rule {rule_id} has an empty {logic} group")]
    EmptyGroup { rule_id: i64, logic: String },

    #[error("error-reviewer-rule-3 Rule {rule_id} has a NOT group with {children} children, expected 1")]
    NotArity { rule_id: i64, children: usize },

    #[error("error-reviewer-rule-4 Rule {rule_id} exceeds maximum depth {max_depth}")]
    DepthExceeded { rule_id: i64, max_depth: usize },

    #[error("error-reviewer-rule-5 Rule {rule_id} has an invalid regex {pattern}: {details}")]
    InvalidRegex {
        rule_id: i64,
        pattern: String,
        details: String,
    },

    #[error("error-reviewer-rule-6 Rule {rule_id} uses {operator} with a non-array operand")]
    InvalidMembershipOperand { rule_id: i64, operator: String },

    #[error("error-reviewer-rule-7 Rule {rule_id} has a condition with an empty field path")]
    EmptyFieldPath { rule_id: i64 },

    #[error("error-reviewer-rule-8 Rule {rule_id} has a function condition with an empty name")]
    EmptyFunctionName { rule_id: i64 },

    #[error("error-reviewer-rule-9 Rule {rule_id} belongs to partition {actual}, expected {expected}")]
    PartitionMismatch {
        rule_id: i64,
        expected: i64,
        actual: i64,
    },
}

/// Failures raised while resolving a function-backed condition.
///
/// These are contained by the matcher and downgraded to a non-match.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionError {
    #[error("error-reviewer-function-1 Function not found: {name}")]
    NotFound { name: String },

    #[error("error-reviewer-function-2 Function execution failed: {name}: {details}")]
    ExecutionFailed { name: String, details: String },

    #[error("error-reviewer-function-3 Remote function service unavailable: {name}: {details}")]
    RemoteUnavailable { name: String, details: String },

    #[error("error-reviewer-function-4 Remote function service rejected call: {name}: {code}: {details}")]
    RemoteRejected {
        name: String,
        code: String,
        details: String,
    },

    #[error("error-reviewer-function-5 Function call timed out: {name} after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
}

impl FunctionError {
    /// Short stable label used for metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            FunctionError::NotFound { .. } => "not_found",
            FunctionError::ExecutionFailed { .. } => "execution_failed",
            FunctionError::RemoteUnavailable { .. } => "remote_unavailable",
            FunctionError::RemoteRejected { .. } => "remote_rejected",
            FunctionError::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("error-reviewer-transport-1 Transient transport failure: {operation}: {details}")]
    Transient { operation: String, details: String },

    #[error("error-reviewer-transport-2 Fatal transport failure: {operation}: {details}")]
    Fatal { operation: String, details: String },
}

impl TransportError {
    pub fn transient(operation: impl Into<String>, details: impl ToString) -> Self {
        TransportError::Transient {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    pub fn fatal(operation: impl Into<String>, details: impl ToString) -> Self {
        TransportError::Fatal {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    /// Classify a Redis error by whether retrying the same command can succeed.
    pub fn from_redis(operation: &str, err: &deadpool_redis::redis::RedisError) -> Self {
        const RETRYABLE_CODES: &[&str] = &["NOGROUP", "LOADING", "TRYAGAIN", "BUSY", "MASTERDOWN"];

        let retryable_code = err
            .code()
            .is_some_and(|code| RETRYABLE_CODES.contains(&code));

        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || retryable_code
        {
            TransportError::transient(operation, err)
        } else {
            TransportError::fatal(operation, err)
        }
    }

    pub fn from_pool(operation: &str, err: &deadpool_redis::PoolError) -> Self {
        TransportError::transient(operation, err)
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(
        "error-reviewer-dispatch-1 Publish retries exhausted after {attempts} attempts, {published}/{total} payloads committed: {last_error}"
    )]
    RetriesExhausted {
        attempts: u32,
        published: usize,
        total: usize,
        last_error: TransportError,
    },

    #[error("error-reviewer-dispatch-2 Fatal output transport failure: {0}")]
    Fatal(TransportError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("error-reviewer-worker-1 Partition {partition} halted on fatal transport error: {source}")]
    TransportFatal {
        partition: i64,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("error-reviewer-repository-1 Rule query failed: {operation}: {source}")]
    QueryFailed {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("error-reviewer-repository-2 Rule repository unavailable: {details}")]
    Unavailable { details: String },

    #[error("error-reviewer-repository-3 Reload notification failed: {details}")]
    NotificationFailed { details: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("error-reviewer-serialization-1 Stream entry is missing field: {field}")]
    MissingField { field: String },

    #[error("error-reviewer-serialization-2 JSON deserialization failed: {data_type}: {source}")]
    JsonDeserializationFailed {
        data_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-reviewer-serialization-3 JSON serialization failed: {data_type}: {source}")]
    JsonSerializationFailed {
        data_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-reviewer-serialization-4 Unknown object type: {object_type}")]
    UnknownObjectType { object_type: String },

    #[error("error-reviewer-serialization-5 Stream entry field is not valid UTF-8: {field}: {source}")]
    InvalidUtf8 {
        field: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

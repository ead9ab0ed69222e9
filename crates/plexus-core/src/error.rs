//! Error types for Plexus
//!
//! Every fallible operation in the host returns [`Result<T>`], whose error
//! channel is a single structured [`PluginError`] record. The [`ErrorKind`]
//! codes are partitioned into ranges:
//!
//! | Range   | Category        |
//! |---------|-----------------|
//! | 100-199 | Loading         |
//! | 200-299 | Initialization  |
//! | 300-399 | Runtime         |
//! | 400-499 | Security        |
//! | 500-599 | System          |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

/// Result type alias using [`PluginError`]
pub type Result<T, E = PluginError> = std::result::Result<T, E>;

/// Error kind with a stable numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorKind {
    /// Artifact file does not exist
    FileNotFound = 100,
    /// Artifact or document has an invalid format
    InvalidFormat = 101,
    /// Opening the artifact failed
    LoadFailed = 102,
    /// Required ABI symbol is missing from the artifact
    SymbolNotFound = 103,
    /// Plugin is already loaded
    AlreadyLoaded = 104,
    /// Plugin is not loaded
    NotLoaded = 105,
    /// No plugin with the requested id exists
    PluginNotFound = 106,

    /// Plugin initialize() failed
    InitializationFailed = 200,
    /// Plugin rejected its configuration
    ConfigurationError = 201,
    /// A required dependency is not available
    DependencyMissing = 202,
    /// Host or dependency version constraint not met
    VersionMismatch = 203,

    /// Operation failed while executing
    ExecutionFailed = 300,
    /// Plugin does not know the requested command
    CommandNotFound = 301,
    /// Command or call parameters are invalid
    InvalidParameters = 302,
    /// Operation is not valid in the current lifecycle state
    StateError = 303,
    /// Argument is invalid
    InvalidArgument = 304,
    /// Requested entity was not found
    NotFound = 305,
    /// Resource is temporarily unavailable
    ResourceUnavailable = 306,
    /// Entity already exists
    AlreadyExists = 307,
    /// Operation is not implemented
    NotImplemented = 308,
    /// Object is in an invalid state
    InvalidState = 309,
    /// Configuration value is invalid
    InvalidConfiguration = 310,
    /// A plugin with this id is already registered
    DuplicatePlugin = 311,
    /// Dependency graph contains a cycle
    CircularDependency = 312,
    /// Operation was cancelled
    OperationCancelled = 313,
    /// Operation is not supported by this plugin
    NotSupported = 314,
    /// No registered version satisfies the request
    IncompatibleVersion = 315,

    /// Security policy was violated
    SecurityViolation = 400,
    /// Caller lacks the required permission
    PermissionDenied = 401,
    /// Signature verification failed
    SignatureInvalid = 402,
    /// Artifact comes from a source that is not trusted
    UntrustedSource = 403,

    /// Allocation failed
    OutOfMemory = 500,
    /// A bounded resource is exhausted (queue, slots, quota)
    ResourceExhausted = 501,
    /// Network transfer failed
    NetworkError = 502,
    /// Filesystem operation failed
    FileSystemError = 503,
    /// Thread or task failure
    ThreadingError = 504,
    /// Operation exceeded its deadline
    Timeout = 505,
}

/// Error category derived from the kind code range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 100-199
    Loading,
    /// 200-299
    Initialization,
    /// 300-399
    Runtime,
    /// 400-499
    Security,
    /// 500-599
    System,
}

/// Error severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, usually an expected outcome
    Info,
    /// Caller mistake or recoverable condition
    Warning,
    /// Operation failed
    Error,
    /// Failure that affects more than the current operation
    Critical,
    /// The host cannot continue safely
    Fatal,
}

impl ErrorKind {
    /// Numeric error code
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Category derived from the code range
    pub const fn category(self) -> ErrorCategory {
        match self.code() {
            100..=199 => ErrorCategory::Loading,
            200..=299 => ErrorCategory::Initialization,
            300..=399 => ErrorCategory::Runtime,
            400..=499 => ErrorCategory::Security,
            _ => ErrorCategory::System,
        }
    }

    /// Severity implied by the kind
    pub const fn severity(self) -> Severity {
        match self {
            ErrorKind::OperationCancelled => Severity::Info,
            ErrorKind::AlreadyLoaded
            | ErrorKind::NotLoaded
            | ErrorKind::CommandNotFound
            | ErrorKind::InvalidParameters
            | ErrorKind::InvalidArgument
            | ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::NotImplemented
            | ErrorKind::NotSupported => Severity::Warning,
            ErrorKind::SecurityViolation
            | ErrorKind::PermissionDenied
            | ErrorKind::SignatureInvalid
            | ErrorKind::UntrustedSource
            | ErrorKind::ResourceExhausted
            | ErrorKind::ThreadingError => Severity::Critical,
            ErrorKind::OutOfMemory => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Stable snake_case name
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::InvalidFormat => "invalid_format",
            ErrorKind::LoadFailed => "load_failed",
            ErrorKind::SymbolNotFound => "symbol_not_found",
            ErrorKind::AlreadyLoaded => "already_loaded",
            ErrorKind::NotLoaded => "not_loaded",
            ErrorKind::PluginNotFound => "plugin_not_found",
            ErrorKind::InitializationFailed => "initialization_failed",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::CommandNotFound => "command_not_found",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::StateError => "state_error",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::DuplicatePlugin => "duplicate_plugin",
            ErrorKind::CircularDependency => "circular_dependency",
            ErrorKind::OperationCancelled => "operation_cancelled",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::IncompatibleVersion => "incompatible_version",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::UntrustedSource => "untrusted_source",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::FileSystemError => "filesystem_error",
            ErrorKind::ThreadingError => "threading_error",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Source location where an error was constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    /// Source file
    pub file: &'static str,
    /// Line number
    pub line: u32,
    /// Column number
    pub column: u32,
}

impl From<&'static Location<'static>> for SourceLocation {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Structured error record returned by every fallible Plexus operation
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PluginError {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    timestamp: DateTime<Utc>,
    location: SourceLocation,
}

impl PluginError {
    /// Create a new error, capturing the caller location
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
            details: None,
            plugin_id: None,
            context: None,
            timestamp: Utc::now(),
            location: Location::caller().into(),
        }
    }

    /// Attach free-form details
    pub fn with_details(mut self, details: impl fmt::Display) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Attach the implicated plugin id
    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    /// Attach the operation context the error occurred in
    pub fn with_context(mut self, context: impl fmt::Display) -> Self {
        self.context = Some(context.to_string());
        self
    }

    /// Error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Optional details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Implicated plugin id, if known
    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    /// Operation context, if any
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// When the error was constructed
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Where the error was constructed
    pub fn location(&self) -> SourceLocation {
        self.location
    }

    /// Severity implied by the kind
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Category implied by the kind
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Whether the error has the given kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Render every populated field on one line for diagnostics
    pub fn to_diagnostic(&self) -> String {
        let mut out = format!(
            "[{}] {} ({}): {}",
            self.severity(),
            self.kind,
            self.kind.code(),
            self.message
        );
        if let Some(pid) = &self.plugin_id {
            out.push_str(&format!(" plugin={pid}"));
        }
        if let Some(details) = &self.details {
            out.push_str(&format!(" details={details}"));
        }
        if let Some(context) = &self.context {
            out.push_str(&format!(" context={context}"));
        }
        out.push_str(&format!(" at {}", self.location));
        out
    }

    /// Plugin with the given id is not registered
    #[track_caller]
    pub fn plugin_not_found(plugin_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        Self::new(ErrorKind::PluginNotFound, format!("Plugin not found: {plugin_id}"))
            .with_plugin(plugin_id)
    }

    /// Generic not-found
    #[track_caller]
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("Not found: {what}"))
    }

    /// Entity already exists
    #[track_caller]
    pub fn already_exists(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AlreadyExists, format!("Already exists: {what}"))
    }

    /// Required dependency is missing
    #[track_caller]
    pub fn dependency_missing(plugin_id: impl fmt::Display, dependency: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::DependencyMissing,
            format!("Plugin {plugin_id} requires missing dependency {dependency}"),
        )
        .with_plugin(plugin_id.to_string())
        .with_details(format!("missing={dependency}"))
    }

    /// Dependency cycle; `path` lists the cycle with the first element repeated at the end
    #[track_caller]
    pub fn circular_dependency(path: &[String]) -> Self {
        Self::new(
            ErrorKind::CircularDependency,
            format!("Circular dependency detected: {}", path.join(" -> ")),
        )
        .with_details(path.join(" -> "))
    }

    /// Operation is not valid in the current state
    #[track_caller]
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidState, msg)
    }

    /// Invalid argument
    #[track_caller]
    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    /// Invalid parameters for a command or call
    #[track_caller]
    pub fn invalid_parameters(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidParameters, msg)
    }

    /// Invalid format of a document or artifact
    #[track_caller]
    pub fn invalid_format(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidFormat, msg)
    }

    /// Invalid configuration value
    #[track_caller]
    pub fn invalid_configuration(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, msg)
    }

    /// Execution failure
    #[track_caller]
    pub fn execution_failed(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ExecutionFailed, msg)
    }

    /// Initialization failure
    #[track_caller]
    pub fn initialization_failed(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InitializationFailed, msg)
    }

    /// Operation not supported by this plugin
    #[track_caller]
    pub fn not_supported(operation: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotSupported, format!("Operation not supported: {operation}"))
    }

    /// Command not found
    #[track_caller]
    pub fn command_not_found(command: impl fmt::Display) -> Self {
        Self::new(ErrorKind::CommandNotFound, format!("Unknown command: {command}"))
    }

    /// Incompatible version
    #[track_caller]
    pub fn incompatible_version(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::IncompatibleVersion, msg)
    }

    /// Deadline elapsed
    #[track_caller]
    pub fn timeout(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    /// Operation cancelled
    #[track_caller]
    pub fn cancelled(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::OperationCancelled, msg)
    }

    /// Bounded resource exhausted
    #[track_caller]
    pub fn resource_exhausted(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ResourceExhausted, msg)
    }

    /// Network failure
    #[track_caller]
    pub fn network(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NetworkError, msg)
    }

    /// Filesystem failure
    #[track_caller]
    pub fn filesystem(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::FileSystemError, msg)
    }

    /// Security violation
    #[track_caller]
    pub fn security(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::SecurityViolation, msg)
    }

    /// Signature verification failure
    #[track_caller]
    pub fn signature_invalid(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::SignatureInvalid, msg)
    }

    /// Untrusted source
    #[track_caller]
    pub fn untrusted_source(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UntrustedSource, msg)
    }

    /// Thread or task failure
    #[track_caller]
    pub fn threading(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ThreadingError, msg)
    }
}

impl From<std::io::Error> for PluginError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::FileSystemError,
        };
        Self::new(kind, format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for PluginError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidFormat, format!("Serialization error: {err}"))
    }
}

/// Annotate the error channel of a [`Result`]
pub trait ResultExt<T> {
    /// Attach the implicated plugin id to an error
    fn with_plugin(self, plugin_id: &str) -> Result<T>;

    /// Attach the operation context to an error
    fn with_context(self, context: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_plugin(self, plugin_id: &str) -> Result<T> {
        self.map_err(|e| {
            if e.plugin_id.is_some() {
                e
            } else {
                e.with_plugin(plugin_id)
            }
        })
    }

    fn with_context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

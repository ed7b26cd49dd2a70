//! Error types for registration, resolution, and configuration.

use crate::key::BackendKey;
use crate::registry::LibraryKind;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised while registering or resolving operations.
///
/// Every error is raised synchronously to the original caller and is never
/// retried. Handler errors abort resolution; no lower-priority substitute is
/// tried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Arguments do not bind to the declared schema, or a schema is malformed.
    #[error("schema mismatch for {op}: {detail}")]
    SchemaMismatch { op: String, detail: String },

    #[error(
        "register(\"{op}\", ...): operator name does not match namespace of the enclosing library \
         (found {found}, expected {expected})"
    )]
    NamespaceMismatch {
        op: String,
        found: String,
        expected: String,
    },

    #[error(
        "register(\"{op}\", ...): dispatch key {key} is inconsistent with the dispatch key \
         {pinned} of the enclosing library"
    )]
    KeyMismatch {
        op: String,
        key: BackendKey,
        pinned: BackendKey,
    },

    #[error("register(\"{op}\", ...): no dispatch key given and library {namespace} pins none")]
    MissingDispatchKey { op: String, namespace: String },

    #[error("{0}")]
    DuplicateRegistration(Duplicate),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("{kind} library for namespace {namespace} cannot {action}")]
    ScopeKindViolation {
        namespace: String,
        kind: LibraryKind,
        action: &'static str,
    },

    #[error("library {namespace} has been closed")]
    ScopeClosed { namespace: String },

    #[error("Unable to cast {found} returned by {op} to the declared return type {expected}")]
    UnrecognizedReturnType {
        op: String,
        expected: String,
        found: String,
    },

    #[error("there is already an active mode ({active}); {detail}")]
    ModeStackConflict { active: String, detail: String },

    #[error("expected to get a dispatch mode, tensor-like subclass, or None but got {0}")]
    InvalidModeArgument(String),

    #[error("mode factory {0} must return a dispatch mode when called with the displaced mode")]
    InvalidModeFactory(String),

    #[error("cannot pop from an empty mode stack")]
    EmptyModeStack,

    #[error("{0}")]
    SubclassContractViolation(String),

    #[error("{operation} is not supported for tensor subclasses (got {subclass})")]
    SubclassUnsupported { operation: String, subclass: String },

    #[error("could not run {op} with dispatch keys {keys}: no kernel, fallback, or handler claims it")]
    UnimplementedOperation { op: String, keys: String },

    #[error("{op} must return a defined result while tracking gradients but got None")]
    UndefinedResultPropagated { op: String },

    #[error("dispatch depth limit {limit} exceeded while resolving {op}")]
    RecursionLimit { op: String, limit: usize },

    /// Operand shapes, dtypes, or states a kernel cannot accept.
    #[error("invalid operand for {op}: {detail}")]
    InvalidOperand { op: String, detail: String },

    /// Raised by user code (kernels, modes, subclass handlers).
    #[error("{origin}: {message}")]
    Handler { origin: String, message: String },
}

impl DispatchError {
    pub fn handler(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn invalid_operand(op: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        Self::InvalidOperand {
            op: op.to_string(),
            detail: detail.into(),
        }
    }
}

/// The thing a rejected registration collided with.
#[derive(Debug, Clone, PartialEq)]
pub enum Duplicate {
    Kernel {
        op: String,
        key: BackendKey,
        namespace: String,
    },
    Fallback {
        key: BackendKey,
    },
    Operator {
        op: String,
    },
    Namespace {
        namespace: String,
    },
}

impl std::fmt::Display for Duplicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel { op, key, namespace } => write!(
                f,
                "this is not allowed since there's already a kernel registered from python \
                 overriding {op}'s behavior for {key} dispatch key and {namespace} namespace"
            ),
            Self::Fallback { key } => write!(
                f,
                "this is not allowed since there's already a fallback registered from python \
                 for {key} dispatch key"
            ),
            Self::Operator { op } => write!(f, "operator {op} is already defined"),
            Self::Namespace { namespace } => write!(
                f,
                "namespace {namespace} is already claimed by another definition library"
            ),
        }
    }
}

/// Errors raised while loading or validating a dispatch configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dispatch config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("key order lists {0} more than once")]
    DuplicateKey(BackendKey),

    #[error("key order is missing {0}")]
    MissingKey(BackendKey),

    #[error("{upper} must rank above {lower}")]
    Ordering {
        upper: BackendKey,
        lower: BackendKey,
    },

    #[error("max_depth must be at least 1")]
    InvalidDepth,
}

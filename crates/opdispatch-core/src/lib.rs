//! # opdispatch-core
//!
//! Extensible operator dispatch: a call to a named operation is routed to
//! exactly one implementation chosen from registered kernels, per-key
//! fallback rules, operand subclass handlers, and ambient interception modes.
//!
//! This crate provides:
//! - `Registry` and `Library` (scoped, revocable registrations)
//! - `BackendKey` and `KeyOrder` (the priority table)
//! - `Dispatcher` and `DispatchCx` (re-entrant resolution)
//! - `Mode`, `ModeStack`, and scoped `ModeGuard`s
//! - `SubclassType` (operand types with their own handlers)
//! - built-in fallbacks for lazy negation, efficient zeros, and gradients
//!
//! ## Resolution
//!
//! ```text
//! call(op, args)
//!     │  bind to schema
//! Call ── keys(operands, modes) − excluded
//!     │  highest priority first
//! Python:    top visible mode │ subclass handler
//! other key: kernel │ fallback (key excluded below)
//!     │
//! coerce to declared returns
//! ```
//!
//! Kernels are opaque. The built-in `aten` kernels exist so that overrides
//! have something to shadow and fallbacks have something to reach.

mod builtins;
pub mod call_log;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod key;
pub mod mode;
pub mod operand;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod value;

pub use builtins::OPERATORS as BUILTIN_OPERATORS;
pub use call_log::{CallLog, LoggingMode};
pub use config::{DEFAULT_MAX_DEPTH, DispatchConfig};
pub use engine::{DispatchCx, Dispatcher, HandlerKind, PlanStep, ResolutionPlan};
pub use error::{ConfigError, DispatchError, DispatchResult, Duplicate};
pub use key::{BackendKey, DEFAULT_KEY_ORDER, KeyOrder, KeySet};
pub use mode::{
    FnMode, Interceptor, Mode, ModeEntry, ModeFactory, ModeGuard, ModeIdentity, ModeSource,
    ModeStack, PushOptions, PushOutcome,
};
pub use operand::{
    DType, Device, SubclassLayout, SubclassType, Tensor, TensorId, TensorMeta, deep_copy,
};
pub use registry::{
    DispatchTable, Kernel, KernelFn, Library, LibraryKind, Provenance, Registry, RowKind, ScopeId,
    TableRow,
};
pub use schema::{ArgType, Argument, OperatorName, OperatorRef, OperatorSchema, Return};
pub use value::{Call, Value};

//! Ambient interception: the [`Mode`] trait and the per-dispatcher mode stack.
//!
//! A mode intercepts every operation resolved while it is on the stack. The
//! engine invokes only the top visible mode and hides it for the duration of
//! the call, so anything the mode issues through its context sees the modes
//! beneath it.

use crate::engine::{DispatchCx, Dispatcher};
use crate::error::{DispatchError, DispatchResult};
use crate::operand::{SubclassId, SubclassType, Tensor};
use crate::value::{Call, Value};
use std::any::TypeId;
use std::sync::Arc;

/// Handles one call at the ambient-interception key. Shared by modes and
/// subclass handlers.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value>;
}

impl<F> Interceptor for F
where
    F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
{
    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        self(cx, call)
    }
}

/// Identity used to recognise re-entry of the mode already on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeIdentity {
    Type(TypeId),
    Subclass(SubclassId),
}

impl ModeIdentity {
    pub fn of<M: Mode>() -> Self {
        Self::Type(TypeId::of::<M>())
    }
}

pub trait Mode: Interceptor {
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>())
    }

    fn identity(&self) -> ModeIdentity {
        ModeIdentity::Type(TypeId::of::<Self>())
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// A mode built from a closure.
pub struct FnMode<F> {
    name: String,
    func: F,
}

impl<F> FnMode<F>
where
    F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Interceptor for FnMode<F>
where
    F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
{
    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        (self.func)(cx, call)
    }
}

impl<F> Mode for FnMode<F>
where
    F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }
}

/// A subclass type enabled as a mode: its handler intercepts every call,
/// whether or not any operand is an instance of it.
struct SubclassMode {
    ty: SubclassType,
    handler: Arc<dyn Interceptor>,
}

impl Interceptor for SubclassMode {
    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        self.handler.intercept(&cx.for_subclass(&self.ty), call)
    }
}

impl Mode for SubclassMode {
    fn name(&self) -> String {
        self.ty.name().to_string()
    }

    fn identity(&self) -> ModeIdentity {
        ModeIdentity::Subclass(self.ty.id())
    }
}

/// One pushed mode with its identity resolved at push time.
#[derive(Clone)]
pub struct ModeEntry {
    mode: Arc<dyn Mode>,
    identity: ModeIdentity,
    name: String,
}

impl ModeEntry {
    fn new(mode: Arc<dyn Mode>) -> Self {
        let identity = mode.identity();
        let name = mode.name();
        Self {
            mode,
            identity,
            name,
        }
    }

    pub fn mode(&self) -> &Arc<dyn Mode> {
        &self.mode
    }

    pub fn identity(&self) -> ModeIdentity {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ModeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeEntry").field("name", &self.name).finish()
    }
}

/// Builds a mode from the mode it will sit on top of.
pub type ModeFactory = Box<dyn FnOnce(Option<Arc<dyn Mode>>) -> Option<Arc<dyn Mode>>>;

/// What a caller asks to push.
pub enum ModeSource {
    None,
    Instance(Arc<dyn Mode>),
    Subclass(SubclassType),
    Factory { name: String, build: ModeFactory },
    /// Always rejected: operands are not modes.
    Operand(Tensor),
}

impl ModeSource {
    pub fn instance(mode: impl Mode) -> Self {
        Self::Instance(Arc::new(mode))
    }

    pub fn factory<F>(name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(Option<Arc<dyn Mode>>) -> Option<Arc<dyn Mode>> + 'static,
    {
        Self::Factory {
            name: name.into(),
            build: Box::new(build),
        }
    }
}

impl From<Arc<dyn Mode>> for ModeSource {
    fn from(mode: Arc<dyn Mode>) -> Self {
        Self::Instance(mode)
    }
}

impl From<SubclassType> for ModeSource {
    fn from(ty: SubclassType) -> Self {
        Self::Subclass(ty)
    }
}

impl From<Tensor> for ModeSource {
    fn from(tensor: Tensor) -> Self {
        Self::Operand(tensor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Push on top of an unrelated active mode.
    pub ignore_preexisting: bool,
    /// Swap out the active mode, which must have this identity.
    pub replace: Option<ModeIdentity>,
}

impl PushOptions {
    pub fn ignore_preexisting() -> Self {
        Self {
            ignore_preexisting: true,
            replace: None,
        }
    }

    pub fn replace(identity: ModeIdentity) -> Self {
        Self {
            ignore_preexisting: false,
            replace: Some(identity),
        }
    }
}

#[derive(Debug)]
pub enum PushOutcome {
    Pushed,
    /// The previous top was swapped out and comes back when the guard exits.
    Replaced(ModeEntry),
    /// The same mode was already on top; nothing changed.
    Absorbed,
    /// `ModeSource::None` was pushed.
    Skipped,
}

/// Top is the most recently pushed entry.
#[derive(Debug, Default)]
pub struct ModeStack {
    entries: Vec<ModeEntry>,
}

impl ModeStack {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top(&self) -> Option<&ModeEntry> {
        self.entries.last()
    }

    /// Mode names, top first.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().rev().map(|e| e.name.clone()).collect()
    }

    pub fn snapshot(&self) -> Arc<[ModeEntry]> {
        self.entries.iter().cloned().collect()
    }

    pub fn push(&mut self, source: ModeSource, options: PushOptions) -> DispatchResult<PushOutcome> {
        match source {
            ModeSource::None => Ok(PushOutcome::Skipped),
            ModeSource::Operand(tensor) => {
                Err(DispatchError::InvalidModeArgument(tensor.describe()))
            }
            ModeSource::Factory { name, build } => {
                let replaced = match options.replace {
                    Some(identity) => Some(self.take_top_matching(identity, &name)?),
                    None => None,
                };
                let displaced = self.top().map(|entry| Arc::clone(&entry.mode));
                let Some(mode) = build(displaced) else {
                    if let Some(entry) = replaced {
                        self.entries.push(entry);
                    }
                    return Err(DispatchError::InvalidModeFactory(name));
                };
                self.entries.push(ModeEntry::new(mode));
                Ok(replaced.map_or(PushOutcome::Pushed, PushOutcome::Replaced))
            }
            ModeSource::Instance(mode) => self.push_entry(ModeEntry::new(mode), options),
            ModeSource::Subclass(ty) => {
                let handler = ty.handler().ok_or_else(|| {
                    DispatchError::InvalidModeArgument(format!(
                        "subclass {} without a dispatch handler",
                        ty.name()
                    ))
                })?;
                let mode: Arc<dyn Mode> = Arc::new(SubclassMode { ty, handler });
                self.push_entry(ModeEntry::new(mode), options)
            }
        }
    }

    fn push_entry(&mut self, entry: ModeEntry, options: PushOptions) -> DispatchResult<PushOutcome> {
        if self.top().is_some_and(|top| top.identity == entry.identity) {
            return Ok(PushOutcome::Absorbed);
        }
        if let Some(identity) = options.replace {
            let replaced = self.take_top_matching(identity, &entry.name)?;
            self.entries.push(entry);
            return Ok(PushOutcome::Replaced(replaced));
        }
        if let Some(top) = self.top() {
            if !options.ignore_preexisting {
                return Err(DispatchError::ModeStackConflict {
                    active: top.name.clone(),
                    detail: format!(
                        "pass ignore_preexisting or replace to push {}",
                        entry.name
                    ),
                });
            }
        }
        self.entries.push(entry);
        Ok(PushOutcome::Pushed)
    }

    fn take_top_matching(&mut self, identity: ModeIdentity, requested: &str) -> DispatchResult<ModeEntry> {
        match self.entries.last() {
            Some(top) if top.identity == identity => self.entries.pop().ok_or(DispatchError::EmptyModeStack),
            Some(top) => Err(DispatchError::ModeStackConflict {
                active: top.name.clone(),
                detail: format!("replace for {requested} does not name it"),
            }),
            None => Err(DispatchError::ModeStackConflict {
                active: "none".to_string(),
                detail: format!("replace for {requested} found an empty stack"),
            }),
        }
    }

    pub fn pop(&mut self) -> DispatchResult<Arc<dyn Mode>> {
        self.entries
            .pop()
            .map(|entry| entry.mode)
            .ok_or(DispatchError::EmptyModeStack)
    }

    /// Undo a push described by `outcome`.
    pub(crate) fn unwind(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Pushed => {
                self.entries.pop();
            }
            PushOutcome::Replaced(previous) => {
                self.entries.pop();
                self.entries.push(previous);
            }
            PushOutcome::Absorbed | PushOutcome::Skipped => {}
        }
    }
}

/// Scoped mode acquisition: undoes its push on every exit path.
#[must_use = "the mode is popped as soon as the guard is dropped"]
pub struct ModeGuard<'d> {
    dispatcher: &'d Dispatcher,
    outcome: Option<PushOutcome>,
}

impl<'d> ModeGuard<'d> {
    pub(crate) fn new(dispatcher: &'d Dispatcher, outcome: PushOutcome) -> Self {
        Self {
            dispatcher,
            outcome: Some(outcome),
        }
    }

    /// Whether the push was absorbed by an identical mode already on top.
    pub fn was_absorbed(&self) -> bool {
        matches!(self.outcome, Some(PushOutcome::Absorbed))
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            tracing::trace!(?outcome, "leaving mode scope");
            self.dispatcher.unwind_mode(outcome);
        }
    }
}

//! The dispatch resolution engine.
//!
//! A [`Dispatcher`] belongs to one calling thread: it owns the mode stack and
//! a dispatch-table cache, and shares the [`Registry`] with everyone else.
//! Every handler receives a [`DispatchCx`] describing where resolution stands
//! (visible modes, excluded keys, the key being handled); re-entering through
//! the context continues from there, so exclusions unwind with the call.

use crate::config::{DEFAULT_MAX_DEPTH, DispatchConfig};
use crate::error::{ConfigError, DispatchError, DispatchResult};
use crate::key::{BackendKey, KeyOrder, KeySet};
use crate::mode::{Mode, ModeEntry, ModeGuard, ModeSource, ModeStack, PushOptions, PushOutcome};
use crate::operand::{self, SubclassType, Tensor};
use crate::registry::{DispatchTable, Registry};
use crate::resolver;
use crate::schema::OperatorName;
use crate::value::{Call, Value};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Dispatcher {
    registry: Registry,
    order: KeyOrder,
    max_depth: usize,
    modes: RefCell<ModeStack>,
    tables: RefCell<HashMap<OperatorName, Arc<DispatchTable>>>,
    /// Nesting depth of the innermost resolution in progress on this thread.
    active_depth: Cell<usize>,
}

impl Dispatcher {
    /// A dispatcher with the default key order and depth limit.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            order: KeyOrder::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            modes: RefCell::new(ModeStack::default()),
            tables: RefCell::new(HashMap::new()),
            active_depth: Cell::new(0),
        }
    }

    pub fn with_config(registry: Registry, config: &DispatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            order: config.key_order()?,
            max_depth: config.max_depth,
            ..Self::new(registry)
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn key_order(&self) -> &KeyOrder {
        &self.order
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Bind positional and keyword arguments to the named operation.
    ///
    /// Fails with `UnknownOperation` when no schema is registered under `op`.
    pub fn bind(&self, op: &str, args: Vec<Value>, kwargs: Vec<(&str, Value)>) -> DispatchResult<Call> {
        let schema = self.registry.find_schema(op)?;
        Call::bind(schema, args, owned_kwargs(kwargs))
    }

    pub fn call(&self, op: &str, args: Vec<Value>) -> DispatchResult<Value> {
        self.root_cx().call(op, args)
    }

    pub fn call_kw(&self, op: &str, args: Vec<Value>, kwargs: Vec<(&str, Value)>) -> DispatchResult<Value> {
        self.root_cx().call_kw(op, args, kwargs)
    }

    pub fn call_bound(&self, call: Call) -> DispatchResult<Value> {
        self.root_cx().call_bound(call)
    }

    /// A top-level context over a snapshot of the current mode stack.
    ///
    /// Inside a handler the context starts at the depth of the resolution in
    /// progress, so root re-entry still counts toward the depth limit.
    pub fn root_cx(&self) -> DispatchCx<'_> {
        let modes = self.modes.borrow().snapshot();
        DispatchCx {
            dispatcher: self,
            visible: modes.len(),
            modes,
            excluded: KeySet::EMPTY,
            current: None,
            subclass: None,
            depth: self.active_depth.get(),
        }
    }

    pub fn push_mode(&self, source: ModeSource, options: PushOptions) -> DispatchResult<PushOutcome> {
        let outcome = self.modes.borrow_mut().push(source, options)?;
        tracing::debug!(?outcome, depth = self.mode_depth(), "pushed mode");
        Ok(outcome)
    }

    pub fn pop_mode(&self) -> DispatchResult<Arc<dyn Mode>> {
        let mode = self.modes.borrow_mut().pop()?;
        tracing::debug!(mode = %mode.name(), depth = self.mode_depth(), "popped mode");
        Ok(mode)
    }

    /// Push a mode for the lifetime of the returned guard.
    pub fn enter_mode(&self, source: ModeSource, options: PushOptions) -> DispatchResult<ModeGuard<'_>> {
        let outcome = self.push_mode(source, options)?;
        Ok(ModeGuard::new(self, outcome))
    }

    /// Run `body` with a mode pushed; the mode is popped however `body` exits.
    pub fn with_mode<R>(
        &self,
        source: ModeSource,
        options: PushOptions,
        body: impl FnOnce() -> DispatchResult<R>,
    ) -> DispatchResult<R> {
        let _guard = self.enter_mode(source, options)?;
        body()
    }

    pub(crate) fn unwind_mode(&self, outcome: PushOutcome) {
        self.modes.borrow_mut().unwind(outcome);
    }

    /// Mode names, top first.
    pub fn mode_names(&self) -> Vec<String> {
        self.modes.borrow().names()
    }

    pub fn mode_depth(&self) -> usize {
        self.modes.borrow().len()
    }

    pub fn deep_copy(&self, tensor: &Tensor) -> DispatchResult<Tensor> {
        operand::deep_copy(self, tensor)
    }

    fn table_for(&self, op: &OperatorName) -> DispatchResult<Arc<DispatchTable>> {
        let generation = self.registry.generation();
        if let Some(table) = self.tables.borrow().get(op) {
            if table.generation() == generation {
                return Ok(Arc::clone(table));
            }
        }
        let table = Arc::new(self.registry.dispatch_table(op)?);
        tracing::trace!(op = %op, generation = table.generation(), "rebuilt dispatch table");
        self.tables
            .borrow_mut()
            .insert(op.clone(), Arc::clone(&table));
        Ok(table)
    }

    fn resolve(&self, cx: &DispatchCx<'_>, call: Call) -> DispatchResult<Value> {
        let op = call.op().clone();
        if cx.depth >= self.max_depth {
            return Err(DispatchError::RecursionLimit {
                op: op.to_string(),
                limit: self.max_depth,
            });
        }
        let span = tracing::debug_span!("dispatch", op = %op, depth = cx.depth);
        let _entered = span.enter();
        let _depth = DepthGuard::enter(&self.active_depth, cx.depth + 1);

        let keys = resolver::compute_keys(&call, cx.visible > 0).difference(cx.excluded);
        let table = match self.table_for(&op) {
            Ok(table) => table,
            Err(DispatchError::UnknownOperation(_)) => {
                tracing::debug!(%keys, "operation is no longer registered");
                return Err(DispatchError::UnimplementedOperation {
                    op: op.to_string(),
                    keys: keys.to_string(),
                });
            }
            Err(err) => return Err(err),
        };
        for key in self.order.descending(keys) {
            let handled = if key == BackendKey::Python {
                self.intercept(cx, &call)?
            } else {
                self.run_key(cx, &table, key, &call)?
            };
            if let Some(value) = handled {
                return call.schema().coerce_return(value);
            }
        }

        tracing::debug!(%keys, excluded = %cx.excluded, "no handler claimed the call");
        Err(DispatchError::UnimplementedOperation {
            op: op.to_string(),
            keys: keys.to_string(),
        })
    }

    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Option<Value>> {
        if let Some(entry) = cx.top_mode() {
            tracing::debug!(mode = entry.name(), "invoking mode");
            let inner = cx.enter(BackendKey::Python).hide_top_mode();
            return entry.mode().intercept(&inner, call).map(Some);
        }
        for ty in resolver::subclass_candidates(call) {
            if let Some(handler) = ty.handler() {
                tracing::debug!(subclass = ty.name(), "invoking subclass handler");
                let inner = cx.enter(BackendKey::Python).for_subclass(&ty);
                return handler.intercept(&inner, call).map(Some);
            }
        }
        Ok(None)
    }

    fn run_key(
        &self,
        cx: &DispatchCx<'_>,
        table: &DispatchTable,
        key: BackendKey,
        call: &Call,
    ) -> DispatchResult<Option<Value>> {
        if let Some(kernel) = table.kernel(key) {
            tracing::debug!(%key, kernel = kernel.name(), "running kernel");
            return kernel.call(&cx.enter(key), call).map(Some);
        }
        if let Some(fallback) = table.fallback(key) {
            tracing::debug!(%key, fallback = fallback.name(), "running fallback");
            return fallback.call(&cx.enter(key).excluding(key), call).map(Some);
        }
        Ok(None)
    }

    /// Describe how `call` would resolve from the top level, without running
    /// anything.
    pub fn plan(&self, call: &Call) -> DispatchResult<ResolutionPlan> {
        let cx = self.root_cx();
        let table = self.table_for(call.op())?;
        let keys = resolver::compute_keys(call, cx.visible > 0);
        let ordered = self.order.descending(keys);

        let mut candidates = Vec::new();
        for key in &ordered {
            let key = *key;
            if key == BackendKey::Python {
                if let Some(entry) = cx.top_mode() {
                    candidates.push(PlanStep {
                        key,
                        handler: HandlerKind::Mode,
                        name: entry.name().to_string(),
                    });
                } else if let Some(ty) = resolver::subclass_candidates(call)
                    .into_iter()
                    .find(|ty| ty.handler().is_some())
                {
                    candidates.push(PlanStep {
                        key,
                        handler: HandlerKind::Subclass,
                        name: ty.name().to_string(),
                    });
                }
            } else if let Some(kernel) = table.kernel(key) {
                candidates.push(PlanStep {
                    key,
                    handler: HandlerKind::Kernel,
                    name: kernel.name().to_string(),
                });
            } else if let Some(fallback) = table.fallback(key) {
                candidates.push(PlanStep {
                    key,
                    handler: HandlerKind::Fallback,
                    name: fallback.name().to_string(),
                });
            }
        }

        Ok(ResolutionPlan {
            operator: call.op().to_string(),
            keys: ordered,
            selected: candidates.first().cloned(),
            candidates,
        })
    }
}

fn owned_kwargs(kwargs: Vec<(&str, Value)>) -> Vec<(String, Value)> {
    kwargs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Raises the dispatcher's active depth for one resolution.
struct DepthGuard<'a> {
    depth: &'a Cell<usize>,
    previous: usize,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>, value: usize) -> Self {
        let previous = depth.replace(value);
        Self { depth, previous }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.previous);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("order", &self.order)
            .field("max_depth", &self.max_depth)
            .field("modes", &self.mode_names())
            .finish()
    }
}

/// Handler kinds, in the order they are consulted at a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
    Mode,
    Subclass,
    Kernel,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub key: BackendKey,
    pub handler: HandlerKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPlan {
    pub operator: String,
    /// Applicable keys, highest priority first.
    pub keys: Vec<BackendKey>,
    /// One step per key with a handler, highest priority first.
    pub candidates: Vec<PlanStep>,
    pub selected: Option<PlanStep>,
}

/// Resolution state handed to every handler.
#[derive(Clone)]
pub struct DispatchCx<'d> {
    dispatcher: &'d Dispatcher,
    modes: Arc<[ModeEntry]>,
    visible: usize,
    excluded: KeySet,
    current: Option<BackendKey>,
    subclass: Option<SubclassType>,
    depth: usize,
}

impl<'d> DispatchCx<'d> {
    pub fn dispatcher(&self) -> &'d Dispatcher {
        self.dispatcher
    }

    /// Re-enter the engine. Modes hidden from this context stay hidden.
    pub fn call(&self, op: &str, args: Vec<Value>) -> DispatchResult<Value> {
        self.call_kw(op, args, Vec::new())
    }

    /// Calls to an operation with no registered schema, including one whose
    /// defining scope has closed, fail with `UnimplementedOperation`.
    pub fn call_kw(&self, op: &str, args: Vec<Value>, kwargs: Vec<(&str, Value)>) -> DispatchResult<Value> {
        let name = OperatorName::parse(op)?;
        let Some(schema) = self.dispatcher.registry.schema(&name) else {
            let provided = args.iter().chain(kwargs.iter().map(|(_, value)| value));
            let keys = resolver::operand_keys(provided, self.visible > 0).difference(self.excluded);
            return Err(DispatchError::UnimplementedOperation {
                op: name.to_string(),
                keys: keys.to_string(),
            });
        };
        let call = Call::bind(schema, args, owned_kwargs(kwargs))?;
        self.call_bound(call)
    }

    pub fn call_bound(&self, call: Call) -> DispatchResult<Value> {
        self.dispatcher.resolve(self, call)
    }

    /// Continue with the keys ranked below the one being handled.
    pub fn redispatch(&self, call: Call) -> DispatchResult<Value> {
        match self.current {
            Some(key) => {
                let above = self.dispatcher.order.at_or_above(key);
                let below = Self {
                    excluded: self.excluded.union(above),
                    ..self.clone()
                };
                below.call_bound(call)
            }
            None => self.call_bound(call),
        }
    }

    /// Ignore every ambient mode; subclass handlers still apply.
    pub fn without_modes(&self) -> Self {
        Self {
            visible: 0,
            ..self.clone()
        }
    }

    /// Skip ambient interception entirely: no modes, no subclass handlers.
    pub fn no_dispatch(&self) -> Self {
        self.excluding(BackendKey::Python)
    }

    pub fn excluding(&self, key: BackendKey) -> Self {
        Self {
            excluded: self.excluded.with(key),
            ..self.clone()
        }
    }

    pub fn excluded(&self) -> KeySet {
        self.excluded
    }

    /// The key whose handler received this context.
    pub fn current_key(&self) -> Option<BackendKey> {
        self.current
    }

    /// The subclass whose handler received this context.
    pub fn subclass(&self) -> Option<&SubclassType> {
        self.subclass.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Names of the modes still visible, top first.
    pub fn visible_modes(&self) -> Vec<String> {
        self.modes[..self.visible]
            .iter()
            .rev()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    /// The mode the next re-entry would invoke.
    pub fn next_mode(&self) -> Option<Arc<dyn Mode>> {
        self.top_mode().map(|entry| Arc::clone(entry.mode()))
    }

    fn top_mode(&self) -> Option<&ModeEntry> {
        self.visible
            .checked_sub(1)
            .and_then(|index| self.modes.get(index))
    }

    fn enter(&self, key: BackendKey) -> Self {
        Self {
            current: Some(key),
            subclass: None,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    fn hide_top_mode(self) -> Self {
        Self {
            visible: self.visible.saturating_sub(1),
            ..self
        }
    }

    pub(crate) fn for_subclass(&self, ty: &SubclassType) -> Self {
        Self {
            subclass: Some(ty.clone()),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for DispatchCx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCx")
            .field("visible_modes", &self.visible_modes())
            .field("excluded", &self.excluded)
            .field("current", &self.current)
            .field("subclass", &self.subclass.as_ref().map(SubclassType::name))
            .field("depth", &self.depth)
            .finish()
    }
}

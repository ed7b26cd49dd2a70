//! The operator registry and revocable registration scopes.
//!
//! Every (operation, key) pair holds at most one built-in kernel and at most
//! one scoped kernel. A scoped kernel shadows the built-in one for as long as
//! the [`Library`] that registered it stays open; closing the library removes
//! exactly the entries it added and exposes whatever was beneath.

use crate::builtins;
use crate::engine::DispatchCx;
use crate::error::{DispatchError, DispatchResult, Duplicate};
use crate::key::BackendKey;
use crate::schema::{OperatorName, OperatorRef, OperatorSchema};
use crate::value::{Call, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

pub type KernelFn = dyn Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync;

/// A named implementation: an operation kernel or a per-key fallback rule.
#[derive(Clone)]
pub struct Kernel {
    name: Arc<str>,
    func: Arc<KernelFn>,
}

impl Kernel {
    pub fn new<F>(name: impl AsRef<str>, func: F) -> Self
    where
        F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        (self.func)(cx, call)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Kernel").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibraryKind {
    /// May introduce new operations; claims its namespace.
    Definition,
    /// May only add implementations for existing operations.
    Override,
    /// May add new overloads and implementations, never redefinitions.
    Extension,
}

impl LibraryKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Definition => "DEF",
            Self::Override => "IMPL",
            Self::Extension => "FRAGMENT",
        }
    }
}

impl std::fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LibraryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEF" | "DEFINITION" => Ok(Self::Definition),
            "IMPL" | "OVERRIDE" => Ok(Self::Override),
            "FRAGMENT" | "EXTENSION" => Ok(Self::Extension),
            _ => Err(format!("unknown library kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(Uuid);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the active implementation for a pair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    Builtin,
    Scoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Builtin,
    Scope(ScopeId),
}

struct OperatorEntry {
    schema: Arc<OperatorSchema>,
    owner: Owner,
}

#[derive(Default, Clone)]
struct Slot {
    builtin: Option<Kernel>,
    scoped: Option<(Kernel, ScopeId)>,
}

impl Slot {
    fn active(&self) -> Option<(Kernel, Provenance)> {
        match (&self.scoped, &self.builtin) {
            (Some((kernel, _)), _) => Some((kernel.clone(), Provenance::Scoped)),
            (None, Some(kernel)) => Some((kernel.clone(), Provenance::Builtin)),
            (None, None) => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.builtin.is_none() && self.scoped.is_none()
    }
}

struct ScopeRecord {
    namespace: String,
    kind: LibraryKind,
    operators: Vec<OperatorName>,
    kernels: Vec<(OperatorName, BackendKey)>,
    fallbacks: Vec<BackendKey>,
}

#[derive(Default)]
struct RegistryState {
    operators: BTreeMap<OperatorName, OperatorEntry>,
    kernels: BTreeMap<(OperatorName, BackendKey), Slot>,
    fallbacks: BTreeMap<BackendKey, Slot>,
    namespaces: BTreeMap<String, Owner>,
    scopes: BTreeMap<ScopeId, ScopeRecord>,
    generation: u64,
}

impl RegistryState {
    fn bump(&mut self) {
        self.generation += 1;
    }

    fn release(&mut self, id: ScopeId) -> bool {
        let Some(record) = self.scopes.remove(&id) else {
            return false;
        };
        for (op, key) in &record.kernels {
            let pair = (op.clone(), *key);
            if let Some(slot) = self.kernels.get_mut(&pair) {
                if slot.scoped.as_ref().is_some_and(|(_, owner)| *owner == id) {
                    slot.scoped = None;
                }
                if slot.is_empty() {
                    self.kernels.remove(&pair);
                }
            }
        }
        for key in &record.fallbacks {
            if let Some(slot) = self.fallbacks.get_mut(key) {
                if slot.scoped.as_ref().is_some_and(|(_, owner)| *owner == id) {
                    slot.scoped = None;
                }
                if slot.is_empty() {
                    self.fallbacks.remove(key);
                }
            }
        }
        for op in &record.operators {
            if self
                .operators
                .get(op)
                .is_some_and(|entry| entry.owner == Owner::Scope(id))
            {
                self.operators.remove(op);
                self.kernels.retain(|(kernel_op, _), _| kernel_op != op);
            }
        }
        if self.namespaces.get(&record.namespace) == Some(&Owner::Scope(id)) {
            self.namespaces.remove(&record.namespace);
        }
        self.bump();
        tracing::info!(
            scope = %id,
            namespace = %record.namespace,
            kind = %record.kind,
            kernels = record.kernels.len(),
            operators = record.operators.len(),
            "released registration scope"
        );
        true
    }
}

/// One row of a dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub key: BackendKey,
    pub kind: RowKind,
    pub name: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RowKind {
    Kernel,
    Fallback,
}

/// The implementations an operation resolves to per key, at one registry
/// generation.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    schema: Arc<OperatorSchema>,
    generation: u64,
    kernels: BTreeMap<BackendKey, (Kernel, Provenance)>,
    fallbacks: BTreeMap<BackendKey, (Kernel, Provenance)>,
}

impl DispatchTable {
    pub fn schema(&self) -> &Arc<OperatorSchema> {
        &self.schema
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kernel(&self, key: BackendKey) -> Option<&Kernel> {
        self.kernels.get(&key).map(|(kernel, _)| kernel)
    }

    pub fn fallback(&self, key: BackendKey) -> Option<&Kernel> {
        self.fallbacks.get(&key).map(|(kernel, _)| kernel)
    }

    /// Rows for every key with a kernel or a fallback. Kernels shadow
    /// fallbacks for the same key.
    pub fn rows(&self) -> Vec<TableRow> {
        let mut rows: BTreeMap<BackendKey, TableRow> = BTreeMap::new();
        for (key, (kernel, provenance)) in &self.fallbacks {
            rows.insert(
                *key,
                TableRow {
                    key: *key,
                    kind: RowKind::Fallback,
                    name: kernel.name().to_string(),
                    provenance: *provenance,
                },
            );
        }
        for (key, (kernel, provenance)) in &self.kernels {
            rows.insert(
                *key,
                TableRow {
                    key: *key,
                    kind: RowKind::Kernel,
                    name: kernel.name().to_string(),
                    provenance: *provenance,
                },
            );
        }
        rows.into_values().collect()
    }
}

/// Process-wide table of operations, kernels, and fallbacks.
///
/// Cloning shares the same table. Mutation is not transactional with respect
/// to calls in flight on other threads.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry with the built-in operations, kernels, and fallbacks.
    pub fn new() -> Self {
        let registry = Self::empty();
        builtins::install(&registry);
        registry
    }

    /// A registry with nothing in it.
    pub fn empty() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// The lazily initialised process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Incremented by every mutation.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn open_scope(
        &self,
        namespace: &str,
        kind: LibraryKind,
        pinned: Option<BackendKey>,
    ) -> DispatchResult<Library> {
        let namespace = namespace.trim();
        if OperatorRef::parse(namespace)
            .ok()
            .filter(|r| r.namespace.is_none() && r.overload.is_none())
            .is_none()
        {
            return Err(DispatchError::SchemaMismatch {
                op: namespace.to_string(),
                detail: "library namespace must be a plain identifier".to_string(),
            });
        }

        let id = ScopeId(Uuid::new_v4());
        let mut state = self.write();
        if kind == LibraryKind::Definition {
            if state.namespaces.contains_key(namespace) {
                return Err(DispatchError::DuplicateRegistration(Duplicate::Namespace {
                    namespace: namespace.to_string(),
                }));
            }
            state
                .namespaces
                .insert(namespace.to_string(), Owner::Scope(id));
        }
        state.scopes.insert(
            id,
            ScopeRecord {
                namespace: namespace.to_string(),
                kind,
                operators: Vec::new(),
                kernels: Vec::new(),
                fallbacks: Vec::new(),
            },
        );
        state.bump();
        drop(state);

        tracing::info!(scope = %id, namespace, %kind, pinned = ?pinned, "opened registration scope");
        Ok(Library {
            registry: self.clone(),
            id,
            namespace: namespace.to_string(),
            kind,
            pinned,
        })
    }

    /// Release a scope. Idempotent.
    pub fn close_scope(&self, library: &Library) {
        library.close();
    }

    /// Release every open scope. Built-in entries stay.
    pub fn teardown(&self) {
        let mut state = self.write();
        let ids: Vec<ScopeId> = state.scopes.keys().copied().collect();
        for id in ids {
            state.release(id);
        }
    }

    pub fn schema(&self, name: &OperatorName) -> Option<Arc<OperatorSchema>> {
        self.read()
            .operators
            .get(name)
            .map(|entry| Arc::clone(&entry.schema))
    }

    /// Look up a schema by its fully qualified name.
    pub fn find_schema(&self, name: &str) -> DispatchResult<Arc<OperatorSchema>> {
        let parsed = OperatorName::parse(name)?;
        self.schema(&parsed)
            .ok_or_else(|| DispatchError::UnknownOperation(parsed.to_string()))
    }

    pub fn operators(&self) -> Vec<Arc<OperatorSchema>> {
        self.read()
            .operators
            .values()
            .map(|entry| Arc::clone(&entry.schema))
            .collect()
    }

    pub fn lookup_kernel(&self, op: &OperatorName, key: BackendKey) -> Option<(Kernel, Provenance)> {
        self.read()
            .kernels
            .get(&(op.clone(), key))
            .and_then(Slot::active)
    }

    pub fn lookup_fallback(&self, key: BackendKey) -> Option<(Kernel, Provenance)> {
        self.read().fallbacks.get(&key).and_then(Slot::active)
    }

    /// Snapshot of everything `op` resolves to at the current generation.
    pub fn dispatch_table(&self, op: &OperatorName) -> DispatchResult<DispatchTable> {
        let state = self.read();
        let entry = state
            .operators
            .get(op)
            .ok_or_else(|| DispatchError::UnknownOperation(op.to_string()))?;
        let kernels = state
            .kernels
            .range((op.clone(), BackendKey::ALL[0])..)
            .take_while(|((kernel_op, _), _)| kernel_op == op)
            .filter_map(|((_, key), slot)| slot.active().map(|active| (*key, active)))
            .collect();
        let fallbacks = state
            .fallbacks
            .iter()
            .filter_map(|(key, slot)| slot.active().map(|active| (*key, active)))
            .collect();
        Ok(DispatchTable {
            schema: Arc::clone(&entry.schema),
            generation: state.generation,
            kernels,
            fallbacks,
        })
    }

    /// SHA-256 over the sorted registry contents. Scope identities are
    /// excluded, so closing a scope restores the digest from before it opened.
    pub fn fingerprint(&self) -> String {
        let state = self.read();
        let mut hasher = Sha256::new();
        for (name, entry) in &state.operators {
            let owner = match entry.owner {
                Owner::Builtin => "builtin",
                Owner::Scope(_) => "scoped",
            };
            hasher.update(format!("op|{name}|{}|{owner}\n", entry.schema));
        }
        for ((op, key), slot) in &state.kernels {
            if let Some(kernel) = &slot.builtin {
                hasher.update(format!("kernel|{op}|{key}|builtin|{}\n", kernel.name()));
            }
            if let Some((kernel, _)) = &slot.scoped {
                hasher.update(format!("kernel|{op}|{key}|scoped|{}\n", kernel.name()));
            }
        }
        for (key, slot) in &state.fallbacks {
            if let Some(kernel) = &slot.builtin {
                hasher.update(format!("fallback|{key}|builtin|{}\n", kernel.name()));
            }
            if let Some((kernel, _)) = &slot.scoped {
                hasher.update(format!("fallback|{key}|scoped|{}\n", kernel.name()));
            }
        }
        for (namespace, owner) in &state.namespaces {
            let owner = match owner {
                Owner::Builtin => "builtin",
                Owner::Scope(_) => "scoped",
            };
            hasher.update(format!("namespace|{namespace}|{owner}\n"));
        }
        format!("{:x}", hasher.finalize())
    }

    /// Number of open scopes.
    pub fn open_scopes(&self) -> usize {
        self.read().scopes.len()
    }

    pub(crate) fn install_builtin_operator(&self, schema: &str) -> DispatchResult<OperatorName> {
        let schema = OperatorSchema::parse(schema)?;
        let name = schema.name.clone();
        let mut state = self.write();
        if state.operators.contains_key(&name) {
            return Err(DispatchError::DuplicateRegistration(Duplicate::Operator {
                op: name.to_string(),
            }));
        }
        state
            .namespaces
            .entry(name.namespace.clone())
            .or_insert(Owner::Builtin);
        state.operators.insert(
            name.clone(),
            OperatorEntry {
                schema: Arc::new(schema),
                owner: Owner::Builtin,
            },
        );
        state.bump();
        Ok(name)
    }

    pub(crate) fn install_builtin_kernel(&self, op: &OperatorName, key: BackendKey, kernel: Kernel) {
        let mut state = self.write();
        state
            .kernels
            .entry((op.clone(), key))
            .or_default()
            .builtin = Some(kernel);
        state.bump();
    }

    pub(crate) fn install_builtin_fallback(&self, key: BackendKey, kernel: Kernel) {
        let mut state = self.write();
        state.fallbacks.entry(key).or_default().builtin = Some(kernel);
        state.bump();
    }
}

/// A revocable registration scope.
///
/// Dropping the library closes it.
pub struct Library {
    registry: Registry,
    id: ScopeId,
    namespace: String,
    kind: LibraryKind,
    pinned: Option<BackendKey>,
}

impl Library {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> LibraryKind {
        self.kind
    }

    pub fn pinned_key(&self) -> Option<BackendKey> {
        self.pinned
    }

    pub fn is_closed(&self) -> bool {
        !self.registry.read().scopes.contains_key(&self.id)
    }

    /// Declare a new operation from its schema string.
    pub fn define(&self, schema: &str) -> DispatchResult<OperatorName> {
        if self.kind == LibraryKind::Override {
            return Err(DispatchError::ScopeKindViolation {
                namespace: self.namespace.clone(),
                kind: self.kind,
                action: "define new operations",
            });
        }
        let schema = OperatorSchema::parse_in(schema, &self.namespace)?;
        let name = schema.name.clone();

        let mut state = self.registry.write();
        if !state.scopes.contains_key(&self.id) {
            return Err(self.closed());
        }
        if state.operators.contains_key(&name) {
            return Err(DispatchError::DuplicateRegistration(Duplicate::Operator {
                op: name.to_string(),
            }));
        }
        state.operators.insert(
            name.clone(),
            OperatorEntry {
                schema: Arc::new(schema),
                owner: Owner::Scope(self.id),
            },
        );
        if let Some(record) = state.scopes.get_mut(&self.id) {
            record.operators.push(name.clone());
        }
        state.bump();
        drop(state);

        tracing::info!(scope = %self.id, op = %name, "defined operation");
        Ok(name)
    }

    /// Register `func` for `op` under `key`, or under the pinned key when
    /// `key` is omitted.
    pub fn register<F>(&self, op: &str, key: impl Into<Option<BackendKey>>, func: F) -> DispatchResult<()>
    where
        F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
    {
        let key = key.into();
        let label = format!(
            "{}::{}[{}]",
            self.namespace,
            op.trim(),
            key.or(self.pinned).map_or("?", BackendKey::as_str)
        );
        self.register_kernel(op, key, Kernel::new(label, func))
    }

    pub fn register_kernel(&self, op: &str, key: Option<BackendKey>, kernel: Kernel) -> DispatchResult<()> {
        let reference = OperatorRef::parse(op)?;
        if let Some(explicit) = &reference.namespace {
            if explicit != &self.namespace {
                return Err(DispatchError::NamespaceMismatch {
                    op: op.trim().to_string(),
                    found: explicit.clone(),
                    expected: self.namespace.clone(),
                });
            }
        }
        let key = match (key, self.pinned) {
            (Some(key), Some(pinned)) if key != pinned => {
                return Err(DispatchError::KeyMismatch {
                    op: op.trim().to_string(),
                    key,
                    pinned,
                });
            }
            (Some(key), _) => key,
            (None, Some(pinned)) => pinned,
            (None, None) => {
                return Err(DispatchError::MissingDispatchKey {
                    op: op.trim().to_string(),
                    namespace: self.namespace.clone(),
                });
            }
        };
        let name = reference.in_namespace(&self.namespace);

        let mut state = self.registry.write();
        if !state.scopes.contains_key(&self.id) {
            return Err(self.closed());
        }
        if !state.operators.contains_key(&name) {
            return Err(DispatchError::UnknownOperation(name.to_string()));
        }
        let pair = (name.clone(), key);
        if state
            .kernels
            .get(&pair)
            .is_some_and(|slot| slot.scoped.is_some())
        {
            return Err(DispatchError::DuplicateRegistration(Duplicate::Kernel {
                op: name.to_string(),
                key,
                namespace: self.namespace.clone(),
            }));
        }
        let kernel_name = kernel.name().to_string();
        state.kernels.entry(pair.clone()).or_default().scoped = Some((kernel, self.id));
        if let Some(record) = state.scopes.get_mut(&self.id) {
            record.kernels.push(pair);
        }
        state.bump();
        drop(state);

        tracing::info!(scope = %self.id, op = %name, %key, kernel = %kernel_name, "registered kernel");
        Ok(())
    }

    /// Register a per-key fallback rule used for every operation without a
    /// kernel for `key`.
    pub fn register_fallback<F>(&self, key: BackendKey, func: F) -> DispatchResult<()>
    where
        F: Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync + 'static,
    {
        if let Some(pinned) = self.pinned {
            if pinned != key {
                return Err(DispatchError::KeyMismatch {
                    op: "fallback".to_string(),
                    key,
                    pinned,
                });
            }
        }
        let kernel = Kernel::new(format!("{}::fallback[{key}]", self.namespace), func);

        let mut state = self.registry.write();
        if !state.scopes.contains_key(&self.id) {
            return Err(self.closed());
        }
        if state
            .fallbacks
            .get(&key)
            .is_some_and(|slot| slot.scoped.is_some())
        {
            return Err(DispatchError::DuplicateRegistration(Duplicate::Fallback { key }));
        }
        state.fallbacks.entry(key).or_default().scoped = Some((kernel, self.id));
        if let Some(record) = state.scopes.get_mut(&self.id) {
            record.fallbacks.push(key);
        }
        state.bump();
        drop(state);

        tracing::info!(scope = %self.id, %key, "registered fallback");
        Ok(())
    }

    /// Remove every entry this library added. Idempotent.
    pub fn close(&self) {
        self.registry.write().release(self.id);
    }

    fn closed(&self) -> DispatchError {
        DispatchError::ScopeClosed {
            namespace: self.namespace.clone(),
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("kind", &self.kind)
            .field("pinned", &self.pinned)
            .finish()
    }
}

use super::Tensor;
use crate::error::{DispatchError, DispatchResult};
use crate::mode::Interceptor;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SUBCLASS_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubclassId(u64);

/// How a subclass instance holds its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubclassLayout {
    /// Holds one inner tensor and allocates nothing itself.
    Wrapper,
    /// Owns storage like a plain tensor.
    NonWrapper,
}

/// Constructs an empty instance of `shape` from a template instance.
pub type NewEmptyHook = Arc<dyn Fn(&Tensor, &[usize]) -> DispatchResult<Tensor> + Send + Sync>;

struct SubclassDef {
    id: SubclassId,
    name: String,
    parent: Option<SubclassType>,
    layout: SubclassLayout,
    handler: Option<Arc<dyn Interceptor>>,
    new_empty: Option<NewEmptyHook>,
}

/// A user-defined tensor type with its own interception handler.
///
/// Subclass types form single-parent chains. A type without its own handler
/// inherits its parent's; a type with no handler anywhere on its chain is
/// ignored at the interception key.
#[derive(Clone)]
pub struct SubclassType(Arc<SubclassDef>);

impl SubclassType {
    pub fn builder(name: impl Into<String>) -> SubclassBuilder {
        SubclassBuilder {
            name: name.into(),
            parent: None,
            layout: None,
            handler: None,
            new_empty: None,
        }
    }

    pub fn id(&self) -> SubclassId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&SubclassType> {
        self.0.parent.as_ref()
    }

    pub fn layout(&self) -> SubclassLayout {
        self.0.layout
    }

    pub fn handler(&self) -> Option<Arc<dyn Interceptor>> {
        match &self.0.handler {
            Some(handler) => Some(Arc::clone(handler)),
            None => self.parent().and_then(SubclassType::handler),
        }
    }

    pub fn new_empty_hook(&self) -> Option<NewEmptyHook> {
        match &self.0.new_empty {
            Some(hook) => Some(Arc::clone(hook)),
            None => self.parent().and_then(SubclassType::new_empty_hook),
        }
    }

    /// Reflexive: every type is a subclass of itself.
    pub fn is_subclass_of(&self, other: &SubclassType) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == other {
                return true;
            }
            current = ty.parent();
        }
        false
    }
}

impl PartialEq for SubclassType {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for SubclassType {}

impl std::fmt::Debug for SubclassType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubclassType")
            .field("name", &self.0.name)
            .field("layout", &self.0.layout)
            .field("parent", &self.parent().map(SubclassType::name))
            .finish()
    }
}

pub struct SubclassBuilder {
    name: String,
    parent: Option<SubclassType>,
    layout: Option<SubclassLayout>,
    handler: Option<Arc<dyn Interceptor>>,
    new_empty: Option<NewEmptyHook>,
}

impl SubclassBuilder {
    /// Derive from `parent`; the layout is inherited unless set explicitly.
    pub fn parent(mut self, parent: &SubclassType) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn wrapper(mut self) -> Self {
        self.layout = Some(SubclassLayout::Wrapper);
        self
    }

    pub fn non_wrapper(mut self) -> Self {
        self.layout = Some(SubclassLayout::NonWrapper);
        self
    }

    pub fn handler(mut self, handler: impl Interceptor) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn Interceptor>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn new_empty<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Tensor, &[usize]) -> DispatchResult<Tensor> + Send + Sync + 'static,
    {
        self.new_empty = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> DispatchResult<SubclassType> {
        let inherited = self.parent.as_ref().map(SubclassType::layout);
        let layout = self
            .layout
            .or(inherited)
            .unwrap_or(SubclassLayout::NonWrapper);
        match inherited {
            Some(parent_layout) if parent_layout != layout => {
                return Err(DispatchError::SubclassContractViolation(format!(
                    "subclass {} must keep the {parent_layout:?} layout of its parent",
                    self.name
                )));
            }
            _ => {}
        }
        let has_handler = self.handler.is_some()
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.handler().is_some());
        if layout == SubclassLayout::Wrapper && !has_handler {
            return Err(DispatchError::SubclassContractViolation(format!(
                "wrapper subclass {} must define a dispatch handler",
                self.name
            )));
        }
        Ok(SubclassType(Arc::new(SubclassDef {
            id: SubclassId(NEXT_SUBCLASS_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            parent: self.parent,
            layout,
            handler: self.handler,
            new_empty: self.new_empty,
        })))
    }
}

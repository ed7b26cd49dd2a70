//! The polymorphic tensor operand.
//!
//! A [`Tensor`] is a cheap handle (`Arc`) over shared state. Plain tensors own
//! dense storage, efficient zero tensors and meta tensors own none, and wrapper
//! subclass instances hold exactly one inner tensor while exposing only its
//! metadata. Aliases (detach, negation views) share storage and the version
//! counter with their base.

mod copy;
mod subclass;

pub use copy::deep_copy;
pub use subclass::{NewEmptyHook, SubclassBuilder, SubclassId, SubclassLayout, SubclassType};

use crate::error::{DispatchError, DispatchResult};
use crate::key::BackendKey;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Meta,
}

impl Device {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Meta => "meta",
        }
    }

    pub const fn backend_key(self) -> BackendKey {
        match self {
            Self::Cpu => BackendKey::Cpu,
            Self::Cuda => BackendKey::Cuda,
            Self::Meta => BackendKey::Meta,
        }
    }

    pub const fn autograd_key(self) -> BackendKey {
        match self {
            Self::Cpu => BackendKey::AutogradCpu,
            Self::Cuda => BackendKey::AutogradCuda,
            Self::Meta => BackendKey::AutogradMeta,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "meta" => Ok(Self::Meta),
            _ => Err(format!("unknown device: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Float32,
    Float64,
    Int64,
    Bool,
}

/// Metadata visible on every tensor, including wrapper subclasses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub storage_offset: usize,
    pub dtype: DType,
    pub device: Device,
    pub requires_grad: bool,
}

impl TensorMeta {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type SharedStorage = Arc<RwLock<Vec<f64>>>;

#[derive(Clone)]
enum Payload {
    Dense(SharedStorage),
    Zero,
    Meta,
    Wrapped(Tensor),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl Layout {
    fn contiguous(shape: &[usize], dtype: DType, device: Device) -> Self {
        let mut strides = vec![1; shape.len()];
        for dim in (0..shape.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * shape[dim + 1].max(1);
        }
        Self {
            shape: shape.to_vec(),
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

struct TensorInner {
    id: TensorId,
    payload: Payload,
    layout: Layout,
    neg: bool,
    subclass: Option<SubclassType>,
    requires_grad: AtomicBool,
    version: Arc<AtomicU64>,
    grad_fn: RwLock<Option<String>>,
}

/// A tensor handle. Cloning the handle never copies data.
#[derive(Clone)]
pub struct Tensor(Arc<TensorInner>);

impl Tensor {
    fn build(payload: Payload, layout: Layout) -> Self {
        Self(Arc::new(TensorInner {
            id: TensorId::next(),
            payload,
            layout,
            neg: false,
            subclass: None,
            requires_grad: AtomicBool::new(false),
            version: Arc::new(AtomicU64::new(0)),
            grad_fn: RwLock::new(None),
        }))
    }

    /// A dense tensor of the given shape.
    pub fn new(shape: &[usize], data: Vec<f64>) -> DispatchResult<Self> {
        let layout = Layout::contiguous(shape, DType::Float32, Device::Cpu);
        if layout.numel() != data.len() {
            return Err(DispatchError::invalid_operand(
                "tensor",
                format!(
                    "shape {shape:?} holds {} elements but {} were given",
                    layout.numel(),
                    data.len()
                ),
            ));
        }
        Ok(Self::build(Payload::Dense(Arc::new(RwLock::new(data))), layout))
    }

    /// A one-dimensional dense tensor.
    pub fn from_vec(data: Vec<f64>) -> Self {
        let layout = Layout::contiguous(&[data.len()], DType::Float32, Device::Cpu);
        Self::build(Payload::Dense(Arc::new(RwLock::new(data))), layout)
    }

    /// A zero-dimensional dense tensor.
    pub fn scalar(value: f64) -> Self {
        let layout = Layout::contiguous(&[], DType::Float32, Device::Cpu);
        Self::build(Payload::Dense(Arc::new(RwLock::new(vec![value]))), layout)
    }

    pub fn full(shape: &[usize], value: f64) -> Self {
        let layout = Layout::contiguous(shape, DType::Float32, Device::Cpu);
        let data = vec![value; layout.numel()];
        Self::build(Payload::Dense(Arc::new(RwLock::new(data))), layout)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// A zero tensor that allocates no storage.
    pub fn efficient_zeros(shape: &[usize]) -> Self {
        Self::build(
            Payload::Zero,
            Layout::contiguous(shape, DType::Float32, Device::Cpu),
        )
    }

    /// A shape-only tensor on the meta device.
    pub fn meta(shape: &[usize]) -> Self {
        Self::build(
            Payload::Meta,
            Layout::contiguous(shape, DType::Float32, Device::Meta),
        )
    }

    /// A tensor with the same payload and metadata but a fresh identity.
    fn derive(&self, layout: Layout, neg: bool, share_version: bool) -> Self {
        let inner = &self.0;
        Self(Arc::new(TensorInner {
            id: TensorId::next(),
            payload: inner.payload.clone(),
            layout,
            neg,
            subclass: inner.subclass.clone(),
            requires_grad: AtomicBool::new(inner.requires_grad.load(Ordering::Relaxed)),
            version: if share_version {
                Arc::clone(&inner.version)
            } else {
                Arc::new(AtomicU64::new(0))
            },
            grad_fn: RwLock::new(None),
        }))
    }

    /// This tensor placed on `device`. Storage stays on the host; the device
    /// tag only steers dispatch. Meta tensors keep their meta placement.
    #[must_use]
    pub fn on(self, device: Device) -> Self {
        if self.device() == device || self.is_meta() {
            return self;
        }
        let layout = Layout {
            device,
            ..self.0.layout.clone()
        };
        self.derive(layout, self.0.neg, true)
    }

    #[must_use]
    pub fn with_dtype(self, dtype: DType) -> Self {
        let layout = Layout {
            dtype,
            ..self.0.layout.clone()
        };
        self.derive(layout, self.0.neg, true)
    }

    #[must_use]
    pub fn with_requires_grad(self, requires_grad: bool) -> Self {
        self.set_requires_grad(requires_grad);
        self
    }

    /// An alias sharing storage and the version counter.
    pub fn alias(&self) -> Self {
        self.derive(self.0.layout.clone(), self.0.neg, true)
    }

    /// An alias whose lazy negation bit is toggled.
    pub fn neg_view(&self) -> Self {
        self.derive(self.0.layout.clone(), !self.0.neg, true)
    }

    /// A view of `len` rows starting at `start` along the first dimension.
    pub fn narrow_rows(&self, start: usize, len: usize) -> DispatchResult<Self> {
        if self.is_wrapper() {
            return Err(self.unsupported("narrowing a wrapper"));
        }
        let Some(&rows) = self.shape().first() else {
            return Err(DispatchError::invalid_operand(
                "narrow",
                "cannot narrow a zero-dimensional tensor",
            ));
        };
        if start + len > rows {
            return Err(DispatchError::invalid_operand(
                "narrow",
                format!("rows {start}..{} out of range for size {rows}", start + len),
            ));
        }
        let mut shape = self.shape().to_vec();
        shape[0] = len;
        let row_stride = self.strides().first().copied().unwrap_or(1);
        let layout = Layout {
            shape,
            storage_offset: self.storage_offset() + start * row_stride,
            ..self.0.layout.clone()
        };
        Ok(self.derive(layout, self.0.neg, true))
    }

    /// A fresh dense tensor with this tensor's shape, dtype, and device.
    pub fn dense_like(&self, data: Vec<f64>) -> DispatchResult<Self> {
        let layout = Layout::contiguous(self.shape(), self.dtype(), self.device());
        if layout.numel() != data.len() {
            return Err(DispatchError::invalid_operand(
                "tensor",
                format!(
                    "shape {:?} holds {} elements but {} were given",
                    self.shape(),
                    layout.numel(),
                    data.len()
                ),
            ));
        }
        let payload = if self.device() == Device::Meta {
            Payload::Meta
        } else {
            Payload::Dense(Arc::new(RwLock::new(data)))
        };
        Ok(Self::build(payload, layout))
    }

    /// A fresh tensor of `shape` sharing this tensor's dtype and device.
    pub fn filled_like(&self, shape: &[usize], value: f64) -> Self {
        let layout = Layout::contiguous(shape, self.dtype(), self.device());
        let payload = if self.device() == Device::Meta {
            Payload::Meta
        } else {
            Payload::Dense(Arc::new(RwLock::new(vec![value; layout.numel()])))
        };
        Self::build(payload, layout)
    }

    /// Wrap `elem`'s storage in a non-wrapper subclass instance.
    pub fn make_subclass(ty: &SubclassType, elem: &Tensor) -> DispatchResult<Self> {
        if ty.layout() != SubclassLayout::NonWrapper {
            return Err(DispatchError::SubclassContractViolation(format!(
                "{} is a wrapper subclass; build instances with make_wrapper",
                ty.name()
            )));
        }
        if let Some(existing) = elem.subclass() {
            return Err(DispatchError::SubclassContractViolation(format!(
                "Creating a new tensor subclass {} but the raw tensor is already associated to \
                 subclass {}",
                ty.name(),
                existing.name()
            )));
        }
        let mut derived = elem.derive(elem.0.layout.clone(), elem.0.neg, true);
        if let Some(inner) = Arc::get_mut(&mut derived.0) {
            inner.subclass = Some(ty.clone());
        }
        Ok(derived)
    }

    /// Wrap `inner` in a wrapper subclass instance that mirrors its metadata
    /// and allocates nothing.
    pub fn make_wrapper(ty: &SubclassType, inner: Tensor) -> DispatchResult<Self> {
        if ty.layout() != SubclassLayout::Wrapper {
            return Err(DispatchError::SubclassContractViolation(format!(
                "{} is a non-wrapper subclass; build instances with make_subclass",
                ty.name()
            )));
        }
        let layout = inner.0.layout.clone();
        let requires_grad = inner.requires_grad();
        let mut wrapper = Self::build(Payload::Wrapped(inner), layout);
        if let Some(state) = Arc::get_mut(&mut wrapper.0) {
            state.subclass = Some(ty.clone());
        }
        wrapper.set_requires_grad(requires_grad);
        Ok(wrapper)
    }

    pub fn id(&self) -> TensorId {
        self.0.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.layout.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.0.layout.strides
    }

    pub fn storage_offset(&self) -> usize {
        self.0.layout.storage_offset
    }

    pub fn dtype(&self) -> DType {
        self.0.layout.dtype
    }

    pub fn device(&self) -> Device {
        self.0.layout.device
    }

    pub fn numel(&self) -> usize {
        self.0.layout.numel()
    }

    pub fn dim(&self) -> usize {
        self.0.layout.shape.len()
    }

    pub fn meta_info(&self) -> TensorMeta {
        let layout = &self.0.layout;
        TensorMeta {
            shape: layout.shape.clone(),
            strides: layout.strides.clone(),
            storage_offset: layout.storage_offset,
            dtype: layout.dtype,
            device: layout.device,
            requires_grad: self.requires_grad(),
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad.load(Ordering::Relaxed)
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.0.requires_grad.store(requires_grad, Ordering::Relaxed);
    }

    /// Name of the operation that produced this tensor under gradient tracking.
    pub fn grad_fn(&self) -> Option<String> {
        self.0
            .grad_fn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_grad_fn(&self, name: impl Into<String>) {
        *self.0.grad_fn.write().unwrap_or_else(PoisonError::into_inner) = Some(name.into());
    }

    pub fn is_neg(&self) -> bool {
        self.0.neg
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.0.payload, Payload::Zero)
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.0.payload, Payload::Meta)
    }

    pub fn subclass(&self) -> Option<&SubclassType> {
        self.0.subclass.as_ref()
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(self.0.payload, Payload::Wrapped(_))
    }

    /// The tensor a wrapper subclass instance holds.
    pub fn inner(&self) -> Option<&Tensor> {
        match &self.0.payload {
            Payload::Wrapped(inner) => Some(inner),
            _ => None,
        }
    }

    /// This tensor with any wrapper of type `ty` removed.
    pub fn unwrap_subclass(&self, ty: &SubclassType) -> Tensor {
        match (&self.0.payload, self.subclass()) {
            (Payload::Wrapped(inner), Some(own)) if own == ty => inner.clone(),
            _ => self.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.0.version.load(Ordering::Acquire)
    }

    pub fn bump_version(&self) {
        self.0.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether both handles refer to the same tensor object.
    pub fn is_same(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        match (&self.0.payload, &other.0.payload) {
            (Payload::Dense(a), Payload::Dense(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Element values as a kernel sees them, with lazy negation and efficient
    /// zeros resolved.
    pub fn values(&self) -> DispatchResult<Vec<f64>> {
        let layout = &self.0.layout;
        match &self.0.payload {
            Payload::Dense(storage) => {
                let guard = storage.read().unwrap_or_else(PoisonError::into_inner);
                let start = layout.storage_offset;
                let end = start + layout.numel();
                let slice = guard.get(start..end).ok_or_else(|| {
                    DispatchError::invalid_operand("tensor", "view exceeds its storage")
                })?;
                Ok(if self.0.neg {
                    slice.iter().map(|v| -v).collect()
                } else {
                    slice.to_vec()
                })
            }
            Payload::Zero => Ok(vec![0.0; layout.numel()]),
            Payload::Meta => Err(DispatchError::invalid_operand(
                "tensor",
                "meta tensors carry no data",
            )),
            Payload::Wrapped(_) => Err(self.unsupported("reading wrapper storage")),
        }
    }

    /// Export element values. Refused for subclass instances.
    pub fn to_vec(&self) -> DispatchResult<Vec<f64>> {
        if self.subclass().is_some() {
            return Err(self.unsupported("to_vec"));
        }
        self.values()
    }

    pub fn item(&self) -> DispatchResult<f64> {
        match self.values()?.as_slice() {
            [value] => Ok(*value),
            other => Err(DispatchError::invalid_operand(
                "item",
                format!("a tensor with {} elements cannot be converted to a scalar", other.len()),
            )),
        }
    }

    /// Overwrite element values in place, through the lazy negation bit, and
    /// bump the shared version counter.
    pub fn write_values(&self, data: &[f64]) -> DispatchResult<()> {
        let layout = &self.0.layout;
        if data.len() != layout.numel() {
            return Err(DispatchError::invalid_operand(
                "write",
                format!("expected {} values, got {}", layout.numel(), data.len()),
            ));
        }
        match &self.0.payload {
            Payload::Dense(storage) => {
                let mut guard = storage.write().unwrap_or_else(PoisonError::into_inner);
                let start = layout.storage_offset;
                let target = guard
                    .get_mut(start..start + data.len())
                    .ok_or_else(|| DispatchError::invalid_operand("write", "view exceeds its storage"))?;
                for (slot, value) in target.iter_mut().zip(data) {
                    *slot = if self.0.neg { -value } else { *value };
                }
            }
            Payload::Zero => {
                return Err(DispatchError::invalid_operand(
                    "write",
                    "efficient zero tensors are immutable",
                ));
            }
            Payload::Meta => {}
            Payload::Wrapped(_) => return Err(self.unsupported("writing wrapper storage")),
        }
        self.bump_version();
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> DispatchError {
        DispatchError::SubclassUnsupported {
            operation: operation.to_string(),
            subclass: self
                .subclass()
                .map(|ty| ty.name().to_string())
                .unwrap_or_else(|| "Tensor".to_string()),
        }
    }

    /// Short type description used in error messages.
    pub fn describe(&self) -> String {
        match self.subclass() {
            Some(ty) => format!("{} instance", ty.name()),
            None => "Tensor instance".to_string(),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.0.id)
            .field("shape", &self.0.layout.shape)
            .field("device", &self.0.layout.device)
            .field("subclass", &self.subclass().map(SubclassType::name))
            .field("neg", &self.0.neg)
            .field("zero", &self.is_zero())
            .finish()
    }
}

impl std::fmt::Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.0.payload {
            Payload::Wrapped(inner) => inner.to_string(),
            Payload::Meta => format!("tensor(..., device='meta', size={:?})", self.shape()),
            _ => match self.values() {
                Ok(values) if self.dim() == 0 => format!("tensor({:?})", values[0]),
                Ok(values) => format!("tensor({values:?})"),
                Err(_) => "tensor(<unavailable>)".to_string(),
            },
        };
        match self.subclass() {
            Some(ty) => write!(f, "{}({body})", ty.name()),
            None => f.write_str(&body),
        }
    }
}

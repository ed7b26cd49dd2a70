//! Built-in `aten` operations with reference kernels and the built-in
//! fallback rules.

mod cpu;
mod meta;

use crate::engine::DispatchCx;
use crate::error::DispatchResult;
use crate::fallback;
use crate::key::BackendKey;
use crate::registry::{Kernel, Registry};
use crate::schema::OperatorName;
use crate::value::{Call, Value};

type KernelPtr = fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value>;

/// Schemas of every built-in operation.
pub const OPERATORS: &[&str] = &[
    "aten::add.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor",
    "aten::add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)",
    "aten::mul.Tensor(Tensor self, Tensor other) -> Tensor",
    "aten::mul.Scalar(Tensor self, Scalar other) -> Tensor",
    "aten::neg(Tensor self) -> Tensor",
    "aten::_neg_view(Tensor(a) self) -> Tensor(a)",
    "aten::resolve_neg(Tensor(a) self) -> Tensor(a)",
    "aten::sum(Tensor self) -> Tensor",
    "aten::abs(Tensor self) -> Tensor",
    "aten::abs.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)",
    "aten::exp(Tensor self) -> Tensor",
    "aten::addmv(Tensor self, Tensor mat, Tensor vec, *, Scalar beta=1, Scalar alpha=1) -> Tensor",
    "aten::kl_div(Tensor self, Tensor target, int reduction=1, *, bool log_target=False) -> Tensor",
    "aten::split.Tensor(Tensor(a) self, int split_size, int dim=0) -> Tensor(a)[]",
    "aten::detach(Tensor(a) self) -> Tensor(a)",
    "aten::clone(Tensor self) -> Tensor",
    "aten::empty_like(Tensor self) -> Tensor",
    "aten::zeros_like(Tensor self) -> Tensor",
    "aten::ones_like(Tensor self) -> Tensor",
    "aten::new_empty(Tensor self, int[] size) -> Tensor",
    "aten::zeros(int[] size, *, Device? device=None) -> Tensor",
    "aten::_efficientzerotensor(int[] size, *, Device? device=None) -> Tensor",
];

const CPU_KERNELS: &[(&str, KernelPtr)] = &[
    ("aten::add.Tensor", cpu::add),
    ("aten::add_.Tensor", cpu::add_),
    ("aten::mul.Tensor", cpu::mul),
    ("aten::mul.Scalar", cpu::mul_scalar),
    ("aten::neg", cpu::neg),
    ("aten::_neg_view", cpu::neg_view),
    ("aten::resolve_neg", cpu::resolve_neg),
    ("aten::sum", cpu::sum),
    ("aten::abs", cpu::abs),
    ("aten::abs.out", cpu::abs_out),
    ("aten::exp", cpu::exp),
    ("aten::addmv", cpu::addmv),
    ("aten::kl_div", cpu::kl_div),
    ("aten::split.Tensor", cpu::split),
    ("aten::detach", cpu::detach),
    ("aten::clone", cpu::clone),
    ("aten::empty_like", cpu::zeros_like),
    ("aten::zeros_like", cpu::zeros_like),
    ("aten::ones_like", cpu::ones_like),
    ("aten::new_empty", cpu::new_empty),
    ("aten::zeros", cpu::zeros),
    ("aten::_efficientzerotensor", cpu::efficient_zeros),
];

const META_KERNELS: &[(&str, KernelPtr)] = &[
    ("aten::add.Tensor", meta::binary),
    ("aten::mul.Tensor", meta::binary),
    ("aten::mul.Scalar", meta::same_shape),
    ("aten::neg", meta::same_shape),
    ("aten::abs", meta::same_shape),
    ("aten::exp", meta::same_shape),
    ("aten::sum", meta::reduction),
    ("aten::detach", cpu::detach),
    ("aten::clone", meta::same_shape),
    ("aten::empty_like", meta::same_shape),
    ("aten::zeros_like", meta::same_shape),
    ("aten::ones_like", meta::same_shape),
    ("aten::new_empty", meta::new_empty),
    ("aten::zeros", meta::factory),
    ("aten::_efficientzerotensor", meta::factory),
];

/// Kernels at keys other than a concrete backend.
const LAYER_KERNELS: &[(&str, BackendKey, KernelPtr)] = &[
    ("aten::mul.Tensor", BackendKey::ZeroTensor, cpu::zero_mul),
    ("aten::mul.Scalar", BackendKey::ZeroTensor, cpu::zero_mul),
    ("aten::_neg_view", BackendKey::Negative, redispatch),
    ("aten::resolve_neg", BackendKey::Negative, redispatch),
    ("aten::detach", BackendKey::AutogradCpu, fallback::autograd_detach),
    ("aten::detach", BackendKey::AutogradCuda, fallback::autograd_detach),
    ("aten::detach", BackendKey::AutogradMeta, fallback::autograd_detach),
];

const FALLBACKS: &[(BackendKey, &str, KernelPtr)] = &[
    (BackendKey::Negative, "negative", fallback::negative),
    (BackendKey::ZeroTensor, "zero_tensor", fallback::zero_tensor),
    (BackendKey::AutogradCpu, "autograd", fallback::autograd),
    (BackendKey::AutogradCuda, "autograd", fallback::autograd),
    (BackendKey::AutogradMeta, "autograd", fallback::autograd),
];

/// Pass straight through to the keys below.
fn redispatch(cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    cx.redispatch(call.clone())
}

fn builtin_name(op: &str) -> OperatorName {
    OperatorName::parse(op).expect("built-in operator names must parse")
}

pub(crate) fn install(registry: &Registry) {
    for schema in OPERATORS {
        registry
            .install_builtin_operator(schema)
            .expect("built-in schemas must parse");
    }
    let backend = CPU_KERNELS
        .iter()
        .map(|(op, func)| (*op, BackendKey::Cpu, *func))
        .chain(META_KERNELS.iter().map(|(op, func)| (*op, BackendKey::Meta, *func)))
        .chain(LAYER_KERNELS.iter().copied());
    for (op, key, func) in backend {
        let name = builtin_name(op);
        let kernel = Kernel::new(format!("{name}[{key}]"), func);
        registry.install_builtin_kernel(&name, key, kernel);
    }
    for (key, label, func) in FALLBACKS {
        registry.install_builtin_fallback(*key, Kernel::new(format!("{label}[{key}]"), *func));
    }
    tracing::debug!(
        operators = OPERATORS.len(),
        fallbacks = FALLBACKS.len(),
        "installed built-in operations"
    );
}

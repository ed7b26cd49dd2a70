//! Built-in per-key fallback rules.
//!
//! A fallback runs for any operation that has no kernel for its key. The
//! engine hands it a context with that key excluded, so every nested call it
//! issues continues below it.

use crate::engine::DispatchCx;
use crate::error::{DispatchError, DispatchResult};
use crate::operand::Tensor;
use crate::schema::ArgType;
use crate::value::{Call, Value};

/// Resolve lazily negated operands, run the operation on the materialized
/// values, and write mutated results back through the original views.
pub fn negative(cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let mut resolved: Vec<(Tensor, Tensor)> = Vec::new();
    let materialized = call.try_map_tensors(|tensor| {
        if !tensor.is_neg() {
            return Ok(tensor.clone());
        }
        let plain = cx
            .call("aten::resolve_neg", vec![Value::Tensor(tensor.clone())])?
            .into_tensor("aten::resolve_neg")?;
        resolved.push((tensor.clone(), plain.clone()));
        Ok(plain)
    })?;

    let out = cx.call_bound(materialized.clone())?;
    write_back(call, &materialized)?;
    let mutated = call.mutable_operands();
    resolved.retain(|(original, _)| mutated.iter().any(|(_, t)| t.is_same(original)));
    Ok(restore_identity(out, &resolved))
}

/// Materialize efficient zero operands as dense zeros and re-issue the call.
pub fn zero_tensor(cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    if call
        .mutable_operands()
        .iter()
        .any(|(_, tensor)| tensor.is_zero())
    {
        return Err(DispatchError::invalid_operand(
            call.op(),
            "efficient zero tensors are immutable",
        ));
    }
    let materialized = call.try_map_tensors(|tensor| {
        if !tensor.is_zero() {
            return Ok(tensor.clone());
        }
        cx.call("aten::zeros_like", vec![Value::Tensor(tensor.clone())])?
            .into_tensor("aten::zeros_like")
    })?;
    cx.call_bound(materialized)
}

/// Run the operation below gradient tracking and mark its outputs as
/// tracked when any input is.
pub fn autograd(cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tracked = call.tensors().iter().any(|tensor| tensor.requires_grad());
    let out = cx.call_bound(call.clone())?;
    if !tracked || !call.schema().is_differentiable() {
        return Ok(out);
    }
    check_defined(call, &out)?;
    let grad_fn = call.op().to_string();
    for tensor in out.tensors() {
        tensor.set_requires_grad(true);
        tensor.set_grad_fn(grad_fn.clone());
    }
    Ok(out)
}

/// `aten::detach` at the autograd keys: the result never tracks gradients.
pub fn autograd_detach(cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let out = cx.redispatch(call.clone())?;
    for tensor in out.tensors() {
        tensor.set_requires_grad(false);
    }
    Ok(out)
}

fn check_defined(call: &Call, out: &Value) -> DispatchResult<()> {
    let undefined = || DispatchError::UndefinedResultPropagated {
        op: call.op().to_string(),
    };
    let returns = &call.schema().returns;
    match (returns.as_slice(), out) {
        ([single], Value::None) if single.ty.is_tensor_like() => Err(undefined()),
        (many, Value::Tuple(items)) if many.len() > 1 => {
            let missing = many
                .iter()
                .zip(items)
                .any(|(ret, item)| ret.ty == ArgType::Tensor && item.is_none());
            if missing { Err(undefined()) } else { Ok(()) }
        }
        _ => Ok(()),
    }
}

fn write_back(original: &Call, materialized: &Call) -> DispatchResult<()> {
    for (slot, target) in original.mutable_operands() {
        if !target.is_neg() {
            continue;
        }
        if let Some(result) = materialized.tensor_at(slot) {
            target.write_values(&result.values()?)?;
        }
    }
    Ok(())
}

fn restore_identity(out: Value, resolved: &[(Tensor, Tensor)]) -> Value {
    if resolved.is_empty() {
        return out;
    }
    out.map_tensors(|tensor| {
        resolved
            .iter()
            .find(|(_, plain)| plain.is_same(tensor))
            .map_or_else(|| tensor.clone(), |(original, _)| original.clone())
    })
}

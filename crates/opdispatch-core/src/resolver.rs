//! Computes which dispatch keys apply to a call.

use crate::key::{BackendKey, KeySet};
use crate::operand::{Device, SubclassType, Tensor};
use crate::value::{Call, Value};

/// The keys a call carries before exclusions are applied.
///
/// Each tensor operand contributes its device key, `Negative` or `ZeroTensor`
/// for lazy representations, and `Python` when it is a subclass instance. The
/// device's autograd key is added when an operand tracks gradients and the
/// operation is differentiable. Calls without tensor operands take their
/// device from a `device` argument, defaulting to CPU.
pub fn compute_keys(call: &Call, modes_active: bool) -> KeySet {
    let mut keys = KeySet::EMPTY;
    let differentiable = call.schema().is_differentiable();
    let tensors = call.tensors();

    for tensor in &tensors {
        insert_operand_keys(&mut keys, tensor);
        if differentiable && tensor.requires_grad() {
            keys.insert(tensor.device().autograd_key());
        }
    }

    if tensors.is_empty() {
        let device = match call.provided("device") {
            Some(Value::Device(device)) => *device,
            _ => Device::Cpu,
        };
        keys.insert(device.backend_key());
    }

    if modes_active {
        keys.insert(BackendKey::Python);
    }
    keys
}

/// Keys for raw arguments that could not be bound to a schema.
///
/// Without a schema differentiability is unknown, so no autograd key is added.
pub fn operand_keys<'a>(values: impl IntoIterator<Item = &'a Value>, modes_active: bool) -> KeySet {
    let mut keys = KeySet::EMPTY;
    let mut device = None;
    let mut any_tensor = false;
    for value in values {
        if let Value::Device(requested) = value {
            device = Some(*requested);
        }
        for tensor in value.tensors() {
            any_tensor = true;
            insert_operand_keys(&mut keys, tensor);
        }
    }
    if !any_tensor {
        keys.insert(device.unwrap_or(Device::Cpu).backend_key());
    }
    if modes_active {
        keys.insert(BackendKey::Python);
    }
    keys
}

fn insert_operand_keys(keys: &mut KeySet, tensor: &Tensor) {
    keys.insert(tensor.device().backend_key());
    if tensor.is_neg() {
        keys.insert(BackendKey::Negative);
    }
    if tensor.is_zero() {
        keys.insert(BackendKey::ZeroTensor);
    }
    if tensor.subclass().is_some() {
        keys.insert(BackendKey::Python);
    }
}

/// Subclass types among the operands ordered so that every subclass precedes
/// its ancestors; unrelated types keep their left-to-right order.
pub fn subclass_candidates(call: &Call) -> Vec<SubclassType> {
    let mut ordered: Vec<SubclassType> = Vec::new();
    for ty in call.subclass_types() {
        match ordered.iter().position(|placed| ty.is_subclass_of(placed)) {
            Some(index) => ordered.insert(index, ty),
            None => ordered.push(ty),
        }
    }
    ordered
}

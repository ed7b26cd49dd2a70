use super::{SubclassLayout, Tensor};
use crate::engine::Dispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::value::Value;

/// Deep-copy a tensor through the clone and new-empty contract.
///
/// Plain tensors and wrapper subclasses are copied with `aten::clone`. A
/// non-wrapper subclass is copied by constructing an empty instance (its own
/// new-empty hook, or `aten::new_empty` through dispatch) and filling it with
/// the source values. Either way the copy must be an instance of the same
/// subclass.
pub fn deep_copy(dispatcher: &Dispatcher, tensor: &Tensor) -> DispatchResult<Tensor> {
    let Some(ty) = tensor.subclass() else {
        return dispatcher
            .call("aten::clone", vec![Value::Tensor(tensor.clone())])?
            .into_tensor("aten::clone");
    };

    match ty.layout() {
        SubclassLayout::Wrapper => {
            let copy = dispatcher
                .call("aten::clone", vec![Value::Tensor(tensor.clone())])?
                .into_tensor("aten::clone")?;
            if copy.subclass() != Some(ty) {
                return Err(DispatchError::SubclassContractViolation(format!(
                    "The default implementation of deep copy for wrapper subclass {} only works \
                     for subclasses for which cloning returns another instance of the same \
                     subclass. Implement a deep copy for the subclass or make clone return the \
                     same subclass.",
                    ty.name()
                )));
            }
            Ok(copy)
        }
        SubclassLayout::NonWrapper => {
            let empty = match ty.new_empty_hook() {
                Some(hook) => hook(tensor, tensor.shape())?,
                None => {
                    let size: Vec<i64> = tensor.shape().iter().map(|d| *d as i64).collect();
                    dispatcher
                        .call(
                            "aten::new_empty",
                            vec![Value::Tensor(tensor.clone()), Value::IntList(size)],
                        )?
                        .into_tensor("aten::new_empty")?
                }
            };
            if empty.subclass() != Some(ty) {
                return Err(DispatchError::SubclassContractViolation(format!(
                    "The default implementation of deep copy for non-wrapper subclass {} only \
                     works for subclasses that implement new_empty() and for which that function \
                     returns another instance of the same subclass.",
                    ty.name()
                )));
            }
            if !tensor.is_meta() {
                empty.write_values(&tensor.values()?)?;
            }
            empty.set_requires_grad(tensor.requires_grad());
            Ok(empty)
        }
    }
}

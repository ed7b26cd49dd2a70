//! Shape-only kernels for the meta device.

use super::cpu::{broadcast_shape, sizes};
use crate::engine::DispatchCx;
use crate::error::DispatchResult;
use crate::operand::Tensor;
use crate::value::{Call, Value};

pub(super) fn binary(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let a = call.tensor("self")?;
    let b = call.tensor("other")?;
    let shape = broadcast_shape(call, &a, &b)?;
    Ok(Value::Tensor(Tensor::meta(&shape).with_dtype(a.dtype())))
}

pub(super) fn same_shape(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let a = call.tensor("self")?;
    Ok(Value::Tensor(Tensor::meta(a.shape()).with_dtype(a.dtype())))
}

pub(super) fn reduction(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let a = call.tensor("self")?;
    Ok(Value::Tensor(Tensor::meta(&[]).with_dtype(a.dtype())))
}

pub(super) fn new_empty(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let a = call.tensor("self")?;
    Ok(Value::Tensor(Tensor::meta(&sizes(call, "size")?).with_dtype(a.dtype())))
}

pub(super) fn factory(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    Ok(Value::Tensor(Tensor::meta(&sizes(call, "size")?)))
}

#[cfg(test)]
mod tests {
    use crate::engine::Dispatcher;
    use crate::operand::{Device, Tensor};
    use crate::registry::Registry;
    use crate::value::Value;

    #[test]
    fn meta_operands_stay_shape_only() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::meta(&[2, 3]);
        let out = d
            .call("aten::mul.Tensor", vec![x.clone().into(), x.into()])
            .expect("meta mul")
            .into_tensor("mul")
            .expect("tensor");
        assert!(out.is_meta());
        assert_eq!(out.shape(), &[2, 3]);
        assert!(out.values().is_err());
    }

    #[test]
    fn meta_factories_follow_the_device_argument() {
        let d = Dispatcher::new(Registry::new());
        let out = d
            .call_kw(
                "aten::zeros",
                vec![Value::IntList(vec![4])],
                vec![("device", Value::Device(Device::Meta))],
            )
            .expect("meta zeros")
            .into_tensor("zeros")
            .expect("tensor");
        assert_eq!(out.device(), Device::Meta);
        assert_eq!(out.to_string(), "tensor(..., device='meta', size=[4])");
    }
}

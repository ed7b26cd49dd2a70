//! Reference CPU kernels.
//!
//! Kernels read operands through [`Tensor::values`], so lazy negation and
//! efficient zeros are already resolved by the time arithmetic happens.
//! Broadcasting is limited to identical shapes and single-element operands.

use crate::engine::DispatchCx;
use crate::error::{DispatchError, DispatchResult};
use crate::operand::{Device, Tensor};
use crate::value::{Call, Value};

pub(super) fn broadcast_shape(call: &Call, a: &Tensor, b: &Tensor) -> DispatchResult<Vec<usize>> {
    if a.shape() == b.shape() || b.numel() == 1 {
        Ok(a.shape().to_vec())
    } else if a.numel() == 1 {
        Ok(b.shape().to_vec())
    } else {
        Err(DispatchError::invalid_operand(
            call.op(),
            format!(
                "shapes {:?} and {:?} are not broadcastable",
                a.shape(),
                b.shape()
            ),
        ))
    }
}

pub(super) fn sizes(call: &Call, name: &str) -> DispatchResult<Vec<usize>> {
    call.int_list(name)?
        .into_iter()
        .map(|dim| {
            usize::try_from(dim).map_err(|_| {
                DispatchError::invalid_operand(call.op(), format!("negative dimension {dim} in {name}"))
            })
        })
        .collect()
}

fn zip_with(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    match (a.len(), b.len()) {
        (_, 1) => a.iter().map(|x| f(*x, b[0])).collect(),
        (1, _) => b.iter().map(|y| f(a[0], *y)).collect(),
        _ => a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect(),
    }
}

/// A fresh result of `shape`, taking dtype and device from `template`.
fn emit(template: &Tensor, shape: &[usize], data: Vec<f64>) -> DispatchResult<Tensor> {
    if shape == template.shape() {
        template.dense_like(data)
    } else {
        template.filled_like(shape, 0.0).dense_like(data)
    }
}

fn binary(call: &Call, f: impl Fn(f64, f64) -> f64) -> DispatchResult<Tensor> {
    let a = call.tensor("self")?;
    let b = call.tensor("other")?;
    let shape = broadcast_shape(call, &a, &b)?;
    let data = zip_with(&a.values()?, &b.values()?, f);
    let template = if shape == a.shape() { &a } else { &b };
    emit(template, &shape, data)
}

fn unary(call: &Call, f: impl Fn(f64) -> f64) -> DispatchResult<Tensor> {
    let a = call.tensor("self")?;
    let data = a.values()?.into_iter().map(f).collect();
    a.dense_like(data)
}

pub(super) fn add(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let alpha = call.scalar("alpha")?;
    binary(call, |x, y| x + alpha * y).map(Value::Tensor)
}

pub(super) fn add_(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let target = call.tensor("self")?;
    let other = call.tensor("other")?;
    let alpha = call.scalar("alpha")?;
    if broadcast_shape(call, &target, &other)? != target.shape() {
        return Err(DispatchError::invalid_operand(
            call.op(),
            format!(
                "output with shape {:?} doesn't match the broadcast shape",
                target.shape()
            ),
        ));
    }
    let data = zip_with(&target.values()?, &other.values()?, |x, y| x + alpha * y);
    target.write_values(&data)?;
    Ok(Value::Tensor(target))
}

pub(super) fn mul(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    binary(call, |x, y| x * y).map(Value::Tensor)
}

pub(super) fn mul_scalar(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let other = call.scalar("other")?;
    unary(call, |x| x * other).map(Value::Tensor)
}

pub(super) fn neg(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    unary(call, |x| -x).map(Value::Tensor)
}

pub(super) fn neg_view(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    Ok(Value::Tensor(call.tensor("self")?.neg_view()))
}

/// Materialize a lazily negated tensor; anything else is returned as is.
pub(super) fn resolve_neg(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    if !tensor.is_neg() {
        return Ok(Value::Tensor(tensor));
    }
    let data = tensor.values()?;
    Ok(Value::Tensor(tensor.dense_like(data)?))
}

pub(super) fn sum(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    let total: f64 = tensor.values()?.iter().sum();
    Ok(Value::Tensor(tensor.filled_like(&[], total)))
}

pub(super) fn abs(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    unary(call, f64::abs).map(Value::Tensor)
}

pub(super) fn abs_out(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let source = call.tensor("self")?;
    let out = call.tensor("out")?;
    if out.shape() != source.shape() {
        return Err(DispatchError::invalid_operand(
            call.op(),
            format!(
                "out has shape {:?} but the result has shape {:?}",
                out.shape(),
                source.shape()
            ),
        ));
    }
    let data: Vec<f64> = source.values()?.into_iter().map(f64::abs).collect();
    out.write_values(&data)?;
    Ok(Value::Tensor(out))
}

pub(super) fn exp(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    unary(call, f64::exp).map(Value::Tensor)
}

/// `beta * self + alpha * (mat @ vec)`.
pub(super) fn addmv(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let bias = call.tensor("self")?;
    let mat = call.tensor("mat")?;
    let vec = call.tensor("vec")?;
    let beta = call.scalar("beta")?;
    let alpha = call.scalar("alpha")?;

    let (rows, cols) = match mat.shape() {
        [rows, cols] => (*rows, *cols),
        other => {
            return Err(DispatchError::invalid_operand(
                call.op(),
                format!("mat must be two-dimensional, got shape {other:?}"),
            ));
        }
    };
    if vec.shape() != [cols] {
        return Err(DispatchError::invalid_operand(
            call.op(),
            format!("size mismatch: mat is {rows}x{cols} but vec has shape {:?}", vec.shape()),
        ));
    }
    if bias.shape() != [rows] && bias.numel() != 1 {
        return Err(DispatchError::invalid_operand(
            call.op(),
            format!("self has shape {:?}, expected [{rows}]", bias.shape()),
        ));
    }

    let m = mat.values()?;
    let v = vec.values()?;
    let product: Vec<f64> = m
        .chunks(cols.max(1))
        .take(rows)
        .map(|row| row.iter().zip(&v).map(|(a, b)| a * b).sum())
        .collect();
    let data = zip_with(&product, &bias.values()?, |mv, b| beta * b + alpha * mv);
    emit(&mat, &[rows], data).map(Value::Tensor)
}

/// Pointwise Kullback-Leibler divergence with `none`, `mean`, or `sum`
/// reduction (0, 1, 2).
pub(super) fn kl_div(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let input = call.tensor("self")?;
    let target = call.tensor("target")?;
    let log_target = call.bool("log_target")?;
    let shape = broadcast_shape(call, &input, &target)?;
    let pointwise = zip_with(&input.values()?, &target.values()?, |x, t| {
        if log_target {
            t.exp() * (t - x)
        } else if t > 0.0 {
            t * (t.ln() - x)
        } else {
            0.0
        }
    });
    let template = if shape == input.shape() { &input } else { &target };
    let out = match call.int("reduction")? {
        0 => emit(template, &shape, pointwise)?,
        1 => {
            let mean = pointwise.iter().sum::<f64>() / pointwise.len().max(1) as f64;
            template.filled_like(&[], mean)
        }
        2 => template.filled_like(&[], pointwise.iter().sum()),
        other => {
            return Err(DispatchError::invalid_operand(
                call.op(),
                format!("{other} is not a valid value for reduction"),
            ));
        }
    };
    Ok(Value::Tensor(out))
}

/// Views along the first dimension; other dimensions produce copies.
pub(super) fn split(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    let size = usize::try_from(call.int("split_size")?)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| DispatchError::invalid_operand(call.op(), "split_size must be positive"))?;
    let rank = tensor.dim() as i64;
    let dim = call.int("dim")?;
    let dim = if dim < 0 { dim + rank } else { dim };
    let dim = usize::try_from(dim)
        .ok()
        .filter(|dim| *dim < tensor.dim())
        .ok_or_else(|| {
            DispatchError::invalid_operand(call.op(), format!("dimension out of range for a {rank}-d tensor"))
        })?;

    let length = tensor.shape()[dim];
    let starts = (0..length).step_by(size);
    if dim == 0 {
        let views = starts
            .map(|start| tensor.narrow_rows(start, size.min(length - start)))
            .collect::<DispatchResult<Vec<_>>>()?;
        return Ok(Value::TensorList(views));
    }

    let values = tensor.values()?;
    let inner: usize = tensor.shape()[dim + 1..].iter().product();
    let outer: usize = tensor.shape()[..dim].iter().product();
    let mut pieces = Vec::new();
    for start in starts {
        let width = size.min(length - start);
        let mut data = Vec::with_capacity(outer * width * inner);
        for o in 0..outer {
            let base = o * length * inner + start * inner;
            data.extend_from_slice(&values[base..base + width * inner]);
        }
        let mut shape = tensor.shape().to_vec();
        shape[dim] = width;
        pieces.push(emit(&tensor, &shape, data)?);
    }
    Ok(Value::TensorList(pieces))
}

/// An alias that does not track gradients.
pub(super) fn detach(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let alias = call.tensor("self")?.alias();
    alias.set_requires_grad(false);
    Ok(Value::Tensor(alias))
}

pub(super) fn clone(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    unary(call, |x| x).map(Value::Tensor)
}

pub(super) fn zeros_like(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    Ok(Value::Tensor(tensor.filled_like(tensor.shape(), 0.0)))
}

pub(super) fn ones_like(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    Ok(Value::Tensor(tensor.filled_like(tensor.shape(), 1.0)))
}

pub(super) fn new_empty(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    let shape = sizes(call, "size")?;
    Ok(Value::Tensor(tensor.filled_like(&shape, 0.0)))
}

pub(super) fn zeros(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let device = call.device("device")?.unwrap_or(Device::Cpu);
    Ok(Value::Tensor(Tensor::zeros(&sizes(call, "size")?).on(device)))
}

pub(super) fn efficient_zeros(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let device = call.device("device")?.unwrap_or(Device::Cpu);
    Ok(Value::Tensor(Tensor::efficient_zeros(&sizes(call, "size")?).on(device)))
}

/// Multiplying by an efficient zero yields an efficient zero.
pub(super) fn zero_mul(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let tensor = call.tensor("self")?;
    let shape = match call.get("other") {
        Some(Value::Tensor(other)) => broadcast_shape(call, &tensor, &other)?,
        _ => tensor.shape().to_vec(),
    };
    let device = call
        .tensors()
        .iter()
        .map(|t| t.device())
        .find(|device| *device != Device::Cpu)
        .unwrap_or(Device::Cpu);
    Ok(Value::Tensor(Tensor::efficient_zeros(&shape).on(device)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Dispatcher;
    use crate::registry::Registry;

    fn values(value: Value) -> Vec<f64> {
        value
            .into_tensor("test")
            .expect("tensor result")
            .values()
            .expect("dense values")
    }

    #[test]
    fn add_scales_other_by_alpha() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::from_vec(vec![1.0, 2.0]);
        let y = Tensor::from_vec(vec![10.0, 20.0]);
        let out = d
            .call_kw("aten::add.Tensor", vec![x.into(), y.into()], vec![("alpha", Value::Int(2))])
            .expect("add");
        assert_eq!(values(out), vec![21.0, 42.0]);
    }

    #[test]
    fn single_element_operands_broadcast() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
        let out = d
            .call("aten::mul.Tensor", vec![Tensor::scalar(2.0).into(), x.into()])
            .expect("mul");
        let out = out.into_tensor("mul").expect("tensor");
        assert_eq!(out.shape(), &[3]);
        assert_eq!(out.values().expect("values"), vec![2.0, 4.0, 6.0]);

        let err = d
            .call(
                "aten::mul.Tensor",
                vec![Tensor::from_vec(vec![1.0, 2.0]).into(), Tensor::from_vec(vec![1.0, 2.0, 3.0]).into()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("not broadcastable"));
    }

    #[test]
    fn add_in_place_returns_the_same_tensor_and_bumps_its_version() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::from_vec(vec![1.0, 2.0]);
        let before = x.version();
        let out = d
            .call("aten::add_.Tensor", vec![x.clone().into(), Tensor::scalar(1.0).into()])
            .expect("add_")
            .into_tensor("add_")
            .expect("tensor");
        assert!(out.is_same(&x));
        assert_eq!(x.values().expect("values"), vec![2.0, 3.0]);
        assert!(x.version() > before);
    }

    #[test]
    fn addmv_computes_matrix_vector_product() {
        let d = Dispatcher::new(Registry::new());
        let bias = Tensor::from_vec(vec![1.0, 1.0]);
        let mat = Tensor::new(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("mat");
        let vec = Tensor::from_vec(vec![1.0, 0.0, -1.0]);
        let out = d
            .call_kw(
                "aten::addmv",
                vec![bias.into(), mat.into(), vec.into()],
                vec![("beta", Value::Int(2))],
            )
            .expect("addmv");
        assert_eq!(values(out), vec![0.0, 0.0]);
    }

    #[test]
    fn kl_div_reductions() {
        let d = Dispatcher::new(Registry::new());
        let input = Tensor::from_vec(vec![0.0, 0.0]);
        let target = Tensor::from_vec(vec![1.0, 1.0]);
        let none = d
            .call(
                "aten::kl_div",
                vec![input.clone().into(), target.clone().into(), Value::Int(0)],
            )
            .expect("none");
        assert_eq!(values(none), vec![0.0, 0.0]);

        let summed = d
            .call_kw(
                "aten::kl_div",
                vec![input.into(), target.into(), Value::Int(2)],
                vec![("log_target", Value::Bool(true))],
            )
            .expect("sum")
            .into_tensor("kl_div")
            .expect("tensor");
        assert_eq!(summed.dim(), 0);
        let expected = 2.0 * std::f64::consts::E;
        assert!((summed.item().expect("item") - expected).abs() < 1e-12);
    }

    #[test]
    fn split_along_rows_returns_aliasing_views() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let parts = d
            .call("aten::split.Tensor", vec![x.clone().into(), Value::Int(2)])
            .expect("split")
            .into_tensor_list("split")
            .expect("list");
        let shapes: Vec<Vec<usize>> = parts.iter().map(|p| p.shape().to_vec()).collect();
        assert_eq!(shapes, vec![vec![2], vec![2], vec![1]]);
        assert_eq!(parts[1].values().expect("values"), vec![3.0, 4.0]);
        assert!(parts[2].shares_storage(&x));
    }

    #[test]
    fn split_along_columns_copies() {
        let d = Dispatcher::new(Registry::new());
        let x = Tensor::new(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("x");
        let parts = d
            .call("aten::split.Tensor", vec![x.into(), Value::Int(2), Value::Int(-1)])
            .expect("split")
            .into_tensor_list("split")
            .expect("list");
        assert_eq!(parts[0].values().expect("values"), vec![1.0, 2.0, 4.0, 5.0]);
        assert_eq!(parts[1].shape(), &[2, 1]);
        assert_eq!(parts[1].values().expect("values"), vec![3.0, 6.0]);
    }

    #[test]
    fn factories_build_plain_and_efficient_zeros() {
        let d = Dispatcher::new(Registry::new());
        let dense = d
            .call("aten::zeros", vec![Value::IntList(vec![2, 2])])
            .expect("zeros")
            .into_tensor("zeros")
            .expect("tensor");
        assert!(!dense.is_zero());
        assert_eq!(dense.numel(), 4);

        let lazy = d
            .call("aten::_efficientzerotensor", vec![Value::IntList(vec![3])])
            .expect("efficient zeros")
            .into_tensor("zeros")
            .expect("tensor");
        assert!(lazy.is_zero());

        let err = d
            .call("aten::zeros", vec![Value::IntList(vec![-1])])
            .unwrap_err();
        assert!(err.to_string().contains("negative dimension"));
    }
}

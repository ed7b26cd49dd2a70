//! Subclass precedence, wrapper contracts, and deep copy.

use opdispatch_core::{
    Call, CallLog, DispatchCx, DispatchError, DispatchResult, Dispatcher, Registry, SubclassType,
    Tensor, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn refusing(name: &'static str) -> impl Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync {
    move |_: &DispatchCx<'_>, _: &Call| Err(DispatchError::handler(name, "intercepted"))
}

fn instance(ty: &SubclassType, data: Vec<f64>) -> Tensor {
    Tensor::make_subclass(ty, &Tensor::from_vec(data)).expect("subclass instance")
}

fn mul_origin(dispatcher: &Dispatcher, a: &Tensor, b: &Tensor) -> String {
    match dispatcher.call("aten::mul.Tensor", vec![a.into(), b.into()]) {
        Err(DispatchError::Handler { origin, .. }) => origin,
        other => panic!("expected a handler error, got {other:?}"),
    }
}

#[test]
fn most_derived_subclass_handles_first() {
    let dispatcher = Dispatcher::new(Registry::new());
    let error_a = SubclassType::builder("ErrorA")
        .handler(refusing("ErrorA"))
        .build()
        .expect("ErrorA");
    let error_b = SubclassType::builder("ErrorB")
        .parent(&error_a)
        .handler(refusing("ErrorB"))
        .build()
        .expect("ErrorB");
    let a = instance(&error_a, vec![1.0]);
    let b = instance(&error_b, vec![1.0]);

    assert_eq!(mul_origin(&dispatcher, &a, &a), "ErrorA");
    assert_eq!(mul_origin(&dispatcher, &a, &b), "ErrorB");
    assert_eq!(mul_origin(&dispatcher, &b, &a), "ErrorB");
}

#[test]
fn repeated_operands_of_one_subclass_invoke_its_handler_once() {
    let dispatcher = Dispatcher::new(Registry::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let counted = SubclassType::builder("Counted")
        .handler(move |cx: &DispatchCx<'_>, call: &Call| {
            counter.fetch_add(1, Ordering::SeqCst);
            cx.no_dispatch().call_bound(call.clone())
        })
        .build()
        .expect("Counted");
    let b = instance(&counted, vec![2.0, 3.0]);

    let out = dispatcher
        .call("aten::mul.Tensor", vec![(&b).into(), (&b).into()])
        .expect("mul")
        .into_tensor("mul")
        .expect("tensor");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(out.values().expect("values"), vec![4.0, 9.0]);
}

#[test]
fn unrelated_subclasses_resolve_left_to_right() {
    let dispatcher = Dispatcher::new(Registry::new());
    let left = SubclassType::builder("Left")
        .handler(refusing("Left"))
        .build()
        .expect("Left");
    let right = SubclassType::builder("Right")
        .handler(refusing("Right"))
        .build()
        .expect("Right");
    let l = instance(&left, vec![1.0]);
    let r = instance(&right, vec![1.0]);
    assert_eq!(mul_origin(&dispatcher, &l, &r), "Left");
    assert_eq!(mul_origin(&dispatcher, &r, &l), "Right");
}

#[test]
fn handlers_are_inherited_and_handlerless_types_are_ignored() {
    let dispatcher = Dispatcher::new(Registry::new());
    let base = SubclassType::builder("Base")
        .handler(refusing("Base"))
        .build()
        .expect("Base");
    let child = SubclassType::builder("Child")
        .parent(&base)
        .build()
        .expect("Child");
    let c = instance(&child, vec![1.0]);
    assert_eq!(mul_origin(&dispatcher, &c, &c), "Base");

    let inert = SubclassType::builder("Inert").build().expect("Inert");
    let x = instance(&inert, vec![2.0, 3.0]);
    let out = dispatcher
        .call("aten::mul.Tensor", vec![x.clone().into(), x.into()])
        .expect("plain kernels handle handlerless subclasses")
        .into_tensor("mul")
        .expect("tensor");
    assert_eq!(out.values().expect("values"), vec![4.0, 9.0]);
}

#[test]
fn wrapper_subclasses_must_define_a_handler() {
    let err = SubclassType::builder("Bare").wrapper().build().unwrap_err();
    assert!(err.to_string().contains("must define a dispatch handler"));

    let base = SubclassType::builder("Plain").build().expect("Plain");
    let err = SubclassType::builder("Wrapping")
        .parent(&base)
        .wrapper()
        .handler(refusing("Wrapping"))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatchError::SubclassContractViolation(_)));
}

#[test]
fn subclass_instances_refuse_raw_export() {
    let ty = SubclassType::builder("Opaque").build().expect("Opaque");
    let x = instance(&ty, vec![1.0]);
    assert!(matches!(
        x.to_vec(),
        Err(DispatchError::SubclassUnsupported { .. })
    ));
    assert_eq!(x.values().expect("kernels still read values"), vec![1.0]);
}

#[test]
fn handlers_delegate_below_interception() {
    let dispatcher = Dispatcher::new(Registry::new());
    let ty = SubclassType::builder("Doubling")
        .handler(|cx: &DispatchCx<'_>, call: &Call| {
            let out = cx.no_dispatch().call_bound(call.clone())?;
            cx.no_dispatch().call("aten::mul.Scalar", vec![out, Value::Int(2)])
        })
        .build()
        .expect("Doubling");
    let x = instance(&ty, vec![1.5]);
    let out = dispatcher
        .call("aten::neg", vec![x.into()])
        .expect("handler should delegate")
        .into_tensor("neg")
        .expect("tensor");
    assert_eq!(out.values().expect("values"), vec![-3.0]);
    assert!(out.subclass().is_none());
}

#[test]
fn deep_copy_of_a_wrapper_goes_through_clone() {
    let dispatcher = Dispatcher::new(Registry::new());
    let log = CallLog::new();
    let ty = log.subclass().expect("LoggingTensor");
    let x = Tensor::make_wrapper(&ty, Tensor::from_vec(vec![1.0, 2.0])).expect("wrapper");

    let copy = dispatcher.deep_copy(&x).expect("deep copy");
    assert_eq!(copy.subclass(), Some(&ty));
    assert!(!copy.is_same(&x));
    assert_eq!(
        copy.inner().expect("inner").values().expect("values"),
        vec![1.0, 2.0]
    );

    let unwrapping = SubclassType::builder("Unwrapping")
        .wrapper()
        .handler(|cx: &DispatchCx<'_>, call: &Call| {
            let ty = cx.subclass().cloned().ok_or_else(|| DispatchError::handler("Unwrapping", "no subclass"))?;
            cx.call_bound(call.map_tensors(|t| t.unwrap_subclass(&ty)))
        })
        .build()
        .expect("Unwrapping");
    let y = Tensor::make_wrapper(&unwrapping, Tensor::from_vec(vec![1.0])).expect("wrapper");
    let err = dispatcher.deep_copy(&y).unwrap_err();
    assert!(err
        .to_string()
        .contains("only works for subclasses for which cloning returns another instance"));
}

#[test]
fn deep_copy_of_a_non_wrapper_needs_new_empty() {
    let dispatcher = Dispatcher::new(Registry::new());
    let plain = SubclassType::builder("NoNewEmpty").build().expect("type");
    let err = dispatcher
        .deep_copy(&instance(&plain, vec![1.0]))
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("only works for subclasses that implement new_empty()"));

    let copyable = SubclassType::builder("Copyable")
        .new_empty(|template: &Tensor, shape: &[usize]| {
            let ty = template
                .subclass()
                .ok_or_else(|| DispatchError::handler("Copyable", "template lost its type"))?;
            Tensor::make_subclass(ty, &Tensor::zeros(shape))
        })
        .build()
        .expect("type");
    let x = instance(&copyable, vec![4.0, 5.0]);
    let copy = dispatcher.deep_copy(&x).expect("deep copy");
    assert_eq!(copy.subclass(), Some(&copyable));
    assert!(!copy.shares_storage(&x));
    assert_eq!(copy.values().expect("values"), vec![4.0, 5.0]);
}

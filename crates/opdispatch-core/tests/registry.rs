//! Registration scopes end to end: define, register, call, close.

use opdispatch_core::{
    BackendKey, Call, DispatchCx, DispatchError, DispatchResult, Dispatcher, Duplicate,
    LibraryKind, Registry, Tensor, Value,
};

fn sum_kernel(_: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
    let total: f64 = call.tensor("self")?.values()?.iter().sum();
    Ok(Value::Tensor(Tensor::scalar(total)))
}

fn constant(value: f64) -> impl Fn(&DispatchCx<'_>, &Call) -> DispatchResult<Value> + Send + Sync {
    move |_: &DispatchCx<'_>, call: &Call| {
        let shape = call.tensor("self")?.shape().to_vec();
        Ok(Value::Tensor(Tensor::full(&shape, value)))
    }
}

fn item(value: Value) -> f64 {
    value
        .into_tensor("test")
        .expect("tensor result")
        .item()
        .expect("single element")
}

#[test]
fn defined_operation_resolves_to_its_kernel_until_closed() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let lib = registry
        .open_scope("foo", LibraryKind::Definition, Some(BackendKey::Cpu))
        .expect("scope should open");
    lib.define("sum(Tensor self) -> Tensor")
        .expect("schema should parse");
    lib.register("sum", None, sum_kernel)
        .expect("kernel should register under the pinned key");

    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
    let out = dispatcher
        .call("foo::sum", vec![x.clone().into()])
        .expect("foo::sum should resolve");
    assert_eq!(item(out), 6.0);

    let bound = dispatcher
        .bind("foo::sum", vec![x.clone().into()], vec![])
        .expect("bind while defined");

    lib.close();
    let err = dispatcher.call("foo::sum", vec![x.clone().into()]).unwrap_err();
    assert!(
        matches!(err, DispatchError::UnimplementedOperation { ref op, ref keys } if op == "foo::sum.default" && keys == "[CPU]"),
        "unexpected error: {err:?}"
    );
    assert!(matches!(
        dispatcher.call_bound(bound),
        Err(DispatchError::UnimplementedOperation { .. })
    ));
    assert!(matches!(
        dispatcher.bind("foo::sum", vec![x.into()], vec![]),
        Err(DispatchError::UnknownOperation(_))
    ));
}

#[test]
fn closing_an_override_restores_behavior_and_fingerprint() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let before = registry.fingerprint();
    let x = Tensor::from_vec(vec![1.0, -2.0]);

    {
        let lib = registry
            .open_scope("aten", LibraryKind::Override, None)
            .expect("scope should open");
        lib.register("neg", BackendKey::Cpu, constant(7.0))
            .expect("override should register");
        let out = dispatcher
            .call("aten::neg", vec![x.clone().into()])
            .expect("override should run")
            .into_tensor("neg")
            .expect("tensor");
        assert_eq!(out.values().expect("values"), vec![7.0, 7.0]);
        assert_ne!(registry.fingerprint(), before);
    }

    assert_eq!(registry.fingerprint(), before);
    let out = dispatcher
        .call("aten::neg", vec![x.into()])
        .expect("built-in kernel should run again")
        .into_tensor("neg")
        .expect("tensor");
    assert_eq!(out.values().expect("values"), vec![-1.0, 2.0]);
}

#[test]
fn one_scoped_kernel_per_pair_at_a_time() {
    let registry = Registry::new();
    let first = registry
        .open_scope("aten", LibraryKind::Override, None)
        .expect("first scope");
    first
        .register("neg", BackendKey::Cpu, constant(1.0))
        .expect("first override");

    let second = registry
        .open_scope("aten", LibraryKind::Override, None)
        .expect("second scope");
    let err = second
        .register("neg", BackendKey::Cpu, constant(2.0))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::DuplicateRegistration(Duplicate::Kernel { .. })
    ));
    assert!(err.to_string().contains("already a kernel registered from python"));

    second
        .register("neg", BackendKey::Meta, constant(2.0))
        .expect("a different key is a different pair");
}

#[test]
fn sequential_overrides_of_the_same_pair() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let x = Tensor::from_vec(vec![3.0]);

    for value in [10.0, 20.0, 30.0] {
        let lib = registry
            .open_scope("aten", LibraryKind::Override, Some(BackendKey::Cpu))
            .expect("scope should open");
        lib.register("neg", None, constant(value))
            .expect("pair should be free again");
        let out = dispatcher
            .call("aten::neg", vec![x.clone().into()])
            .expect("override should run");
        assert_eq!(item(out), value);
    }
    assert_eq!(registry.open_scopes(), 0);
}

#[test]
fn extension_scopes_add_overloads_without_claiming_the_namespace() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let lib = registry
        .open_scope("aten", LibraryKind::Extension, Some(BackendKey::Cpu))
        .expect("scope should open");
    lib.define("neg.twice(Tensor self) -> Tensor")
        .expect("new overload should be accepted");
    let err = lib.define("neg(Tensor self) -> Tensor").unwrap_err();
    assert!(matches!(
        err,
        DispatchError::DuplicateRegistration(Duplicate::Operator { .. })
    ));

    lib.register("neg.twice", None, |cx: &DispatchCx<'_>, call: &Call| {
        let once = cx.call("aten::neg", vec![call.get("self").unwrap_or(Value::None)])?;
        cx.call("aten::neg", vec![once])
    })
    .expect("kernel should register");

    let out = dispatcher
        .call("aten::neg.twice", vec![Tensor::scalar(4.0).into()])
        .expect("overload should resolve");
    assert_eq!(item(out), 4.0);
}

#[test]
fn fallbacks_claim_operations_without_a_kernel() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let x = Tensor::from_vec(vec![1.0]).on(opdispatch_core::Device::Cuda);

    let err = dispatcher.call("aten::exp", vec![x.clone().into()]).unwrap_err();
    assert!(matches!(err, DispatchError::UnimplementedOperation { .. }));

    let lib = registry
        .open_scope("aten", LibraryKind::Override, None)
        .expect("scope should open");
    lib.register_fallback(BackendKey::Cuda, |_: &DispatchCx<'_>, _: &Call| {
        Ok(Value::Tensor(Tensor::scalar(-1.0)))
    })
    .expect("fallback should register");
    let out = dispatcher
        .call("aten::exp", vec![x.into()])
        .expect("fallback should run");
    assert_eq!(item(out), -1.0);
}

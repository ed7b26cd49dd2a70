//! Resolution order, re-entry, configuration, and plans.

use opdispatch_core::{
    BackendKey, Call, DispatchConfig, DispatchCx, DispatchError, Dispatcher, FnMode, HandlerKind,
    LibraryKind, ModeSource, PushOptions, Registry, Tensor, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn plan_lists_every_handler_highest_first() {
    let dispatcher = Dispatcher::new(Registry::new());
    let x = Tensor::from_vec(vec![1.0]).with_requires_grad(true).neg_view();
    let call = dispatcher
        .bind("aten::mul.Tensor", vec![x.clone().into(), x.into()], vec![])
        .expect("bind");
    let plan = dispatcher.plan(&call).expect("plan");

    assert_eq!(
        plan.keys,
        vec![BackendKey::AutogradCpu, BackendKey::Negative, BackendKey::Cpu]
    );
    let steps: Vec<(BackendKey, HandlerKind, String)> = plan
        .candidates
        .iter()
        .map(|step| (step.key, step.handler, step.name.clone()))
        .collect();
    assert_eq!(
        steps,
        vec![
            (BackendKey::AutogradCpu, HandlerKind::Fallback, "autograd[AutogradCPU]".to_string()),
            (BackendKey::Negative, HandlerKind::Fallback, "negative[Negative]".to_string()),
            (BackendKey::Cpu, HandlerKind::Kernel, "aten::mul.Tensor[CPU]".to_string()),
        ]
    );
    assert_eq!(plan.selected.as_ref(), plan.candidates.first());
}

#[test]
fn plans_serialize_for_reports() {
    let dispatcher = Dispatcher::new(Registry::new());
    let call = dispatcher
        .bind("aten::neg", vec![Tensor::from_vec(vec![1.0]).into()], vec![])
        .expect("bind");
    let plan = dispatcher.plan(&call).expect("plan");
    insta::assert_json_snapshot!(plan, @r#"
    {
      "operator": "aten::neg.default",
      "keys": [
        "CPU"
      ],
      "candidates": [
        {
          "key": "CPU",
          "handler": "kernel",
          "name": "aten::neg.default[CPU]"
        }
      ],
      "selected": {
        "key": "CPU",
        "handler": "kernel",
        "name": "aten::neg.default[CPU]"
      }
    }
    "#);

    let value = serde_json::to_value(&plan).expect("plan should serialize");
    assert_eq!(value["selected"]["handler"], "kernel");
}

#[test]
fn configured_order_changes_which_layer_runs_first() {
    let config = DispatchConfig::from_toml_str(
        r#"
key_order = ["Meta", "CUDA", "CPU", "Python", "ZeroTensor", "Negative",
             "AutogradMeta", "AutogradCUDA", "AutogradCPU"]
"#,
    )
    .expect("config");
    let custom = Dispatcher::with_config(Registry::new(), &config).expect("dispatcher");
    let default = Dispatcher::new(Registry::new());

    let n = Tensor::from_vec(vec![2.0]).neg_view();
    let z = Tensor::efficient_zeros(&[1]);
    let keys = |dispatcher: &Dispatcher| {
        let call = dispatcher
            .bind("aten::mul.Tensor", vec![n.clone().into(), z.clone().into()], vec![])
            .expect("bind");
        dispatcher.plan(&call).expect("plan").keys
    };
    assert_eq!(
        keys(&default),
        vec![BackendKey::ZeroTensor, BackendKey::Negative, BackendKey::Cpu]
    );
    assert_eq!(
        keys(&custom),
        vec![BackendKey::Negative, BackendKey::ZeroTensor, BackendKey::Cpu]
    );

    for dispatcher in [&default, &custom] {
        let out = dispatcher
            .call("aten::mul.Tensor", vec![n.clone().into(), z.clone().into()])
            .expect("mul")
            .into_tensor("mul")
            .expect("tensor");
        assert_eq!(out.values().expect("values"), vec![0.0]);
    }
}

#[test]
fn runaway_re_entry_hits_the_depth_limit() {
    let registry = Registry::new();
    let config = DispatchConfig {
        max_depth: 8,
        ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::with_config(registry.clone(), &config).expect("dispatcher");
    let lib = registry
        .open_scope("foo", LibraryKind::Definition, Some(BackendKey::Cpu))
        .expect("scope");
    lib.define("spin(Tensor self) -> Tensor").expect("define");
    lib.register("spin", None, |cx: &DispatchCx<'_>, call: &Call| {
        cx.call_bound(call.clone())
    })
    .expect("register");

    let err = dispatcher
        .call("foo::spin", vec![Tensor::scalar(0.0).into()])
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::RecursionLimit {
            op: "foo::spin.default".to_string(),
            limit: 8,
        }
    );
}

#[test]
fn root_re_entry_from_a_mode_counts_toward_the_depth_limit() {
    let config = DispatchConfig {
        max_depth: 8,
        ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::with_config(Registry::new(), &config).expect("dispatcher");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mode = FnMode::new("Reentrant", move |cx: &DispatchCx<'_>, call: &Call| {
        counter.fetch_add(1, Ordering::SeqCst);
        cx.dispatcher().call_bound(call.clone())
    });

    let err = {
        let _guard = dispatcher
            .enter_mode(ModeSource::instance(mode), PushOptions::default())
            .expect("push");
        dispatcher
            .call("aten::neg", vec![Tensor::scalar(1.0).into()])
            .unwrap_err()
    };
    assert_eq!(
        err,
        DispatchError::RecursionLimit {
            op: "aten::neg.default".to_string(),
            limit: 8,
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 8);

    let out = dispatcher
        .call("aten::neg", vec![Tensor::scalar(1.0).into()])
        .expect("depth resets once the failed call unwinds")
        .into_tensor("neg")
        .expect("tensor");
    assert_eq!(out.item().expect("item"), -1.0);
}

#[test]
fn redispatch_continues_below_the_current_key() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let lib = registry
        .open_scope("aten", LibraryKind::Override, Some(BackendKey::AutogradCpu))
        .expect("scope");
    lib.register("neg", None, move |cx: &DispatchCx<'_>, call: &Call| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(cx.current_key(), Some(BackendKey::AutogradCpu));
        cx.redispatch(call.clone())
    })
    .expect("register");

    let x = Tensor::from_vec(vec![5.0]).with_requires_grad(true);
    let out = dispatcher
        .call("aten::neg", vec![x.clone().into()])
        .expect("neg")
        .into_tensor("neg")
        .expect("tensor");
    assert_eq!(out.values().expect("values"), vec![-5.0]);
    assert!(!out.requires_grad());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let plain = Tensor::from_vec(vec![5.0]);
    dispatcher
        .call("aten::neg", vec![plain.into()])
        .expect("untracked neg");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_results_are_checked_against_declared_returns() {
    let registry = Registry::new();
    let dispatcher = Dispatcher::new(registry.clone());
    let lib = registry
        .open_scope("foo", LibraryKind::Definition, Some(BackendKey::Cpu))
        .expect("scope");
    lib.define("halves(Tensor self) -> Tensor[]").expect("define");
    lib.define("count(Tensor self) -> int").expect("define");
    lib.register("halves", None, |_: &DispatchCx<'_>, call: &Call| {
        let x = call.tensor("self")?;
        Ok(Value::Tuple(vec![Value::Tensor(x.clone()), Value::Tensor(x)]))
    })
    .expect("register");
    lib.register("count", None, |_: &DispatchCx<'_>, _: &Call| {
        Ok(Value::Str("three".to_string()))
    })
    .expect("register");

    let halves = dispatcher
        .call("foo::halves", vec![Tensor::scalar(1.0).into()])
        .expect("tuple of tensors is accepted as a list");
    assert!(matches!(halves, Value::TensorList(ref items) if items.len() == 2));

    let err = dispatcher
        .call("foo::count", vec![Tensor::scalar(1.0).into()])
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnrecognizedReturnType { .. }));
    assert!(err.to_string().starts_with("Unable to cast"));
}

#[test]
fn bind_rejects_arguments_that_do_not_fit() {
    let dispatcher = Dispatcher::new(Registry::new());
    let err = dispatcher
        .bind("aten::mul.Tensor", vec![Tensor::scalar(1.0).into()], vec![])
        .unwrap_err();
    assert!(matches!(err, DispatchError::SchemaMismatch { .. }));

    let err = dispatcher
        .bind(
            "aten::neg",
            vec![Tensor::scalar(1.0).into()],
            vec![("alpha", Value::Int(1))],
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::SchemaMismatch { .. }));

    assert!(matches!(
        dispatcher.bind("aten::nonexistent", vec![], vec![]),
        Err(DispatchError::UnknownOperation(_))
    ));
    assert!(matches!(
        dispatcher.call("aten::nonexistent", vec![]),
        Err(DispatchError::UnimplementedOperation { .. })
    ));
}

//! Call logs recorded through a wrapper subclass and through a mode.

use insta::assert_snapshot;
use opdispatch_core::{
    CallLog, Dispatcher, ModeSource, PushOptions, Registry, Tensor, Value,
};

#[test]
fn logging_tensor_records_each_call_with_normalized_arguments() {
    let dispatcher = Dispatcher::new(Registry::new());
    let log = CallLog::new();
    let ty = log.subclass().expect("LoggingTensor should build");
    let x = Tensor::make_wrapper(&ty, Tensor::from_vec(vec![1.0, 2.0])).expect("wrapper");
    log.log_input("x", &x);

    let y = dispatcher
        .call("aten::mul.Tensor", vec![x.clone().into(), x.clone().into()])
        .expect("mul");
    let z = dispatcher
        .call_kw(
            "aten::add.Tensor",
            vec![y.clone(), x.clone().into()],
            vec![("alpha", Value::Int(2))],
        )
        .expect("add");
    dispatcher
        .call_kw(
            "aten::add.Tensor",
            vec![z.clone(), y],
            vec![("alpha", Value::Int(1))],
        )
        .expect("add with default alpha");
    dispatcher
        .call("aten::kl_div", vec![z.clone(), x.clone().into(), Value::Int(1)])
        .expect("kl_div");
    dispatcher
        .call("aten::split.Tensor", vec![x.into(), Value::Int(1)])
        .expect("split");

    assert_snapshot!(log.render(), @r"
    $0 = input('x')
    $1 = aten::mul.Tensor($0, $0)
    $2 = aten::add.Tensor($1, $0, alpha=2)
    $3 = aten::add.Tensor($2, $1)
    $4 = aten::kl_div.default($2, $0)
    [$5, $6] = aten::split.Tensor($0, 1)
    ");

    let z = z.into_tensor("add").expect("tensor");
    assert_eq!(z.subclass(), Some(&ty));
    assert_eq!(z.to_string(), "LoggingTensor(tensor([3.0, 8.0]))");
}

#[test]
fn in_place_calls_keep_the_wrapper_handle() {
    let dispatcher = Dispatcher::new(Registry::new());
    let log = CallLog::new();
    let ty = log.subclass().expect("LoggingTensor should build");
    let x = Tensor::make_wrapper(&ty, Tensor::from_vec(vec![1.0])).expect("wrapper");
    log.log_input("x", &x);

    let out = dispatcher
        .call("aten::add_.Tensor", vec![x.clone().into(), Tensor::scalar(1.0).into()])
        .expect("add_")
        .into_tensor("add_")
        .expect("tensor");
    assert!(out.is_same(&x));

    assert_snapshot!(log.render(), @r"
    $0 = input('x')
    $0 = aten::add_.Tensor($0, $1)
    ");
}

#[test]
fn logging_mode_records_one_line_per_call() {
    let dispatcher = Dispatcher::new(Registry::new());
    let log = CallLog::new();
    let x = Tensor::from_vec(vec![1.0, -2.0]).with_requires_grad(true);
    log.log_input("x", &x);

    dispatcher
        .with_mode(ModeSource::instance(log.mode()), PushOptions::default(), || {
            let n = dispatcher.call("aten::neg", vec![x.clone().into()])?;
            dispatcher.call("aten::detach", vec![n])?;
            dispatcher.call_kw(
                "aten::zeros",
                vec![Value::IntList(vec![2])],
                vec![("device", Value::Device(opdispatch_core::Device::Cpu))],
            )
        })
        .expect("calls under the mode");

    assert_snapshot!(log.render(), @r"
    $0 = input('x')
    $1 = aten::neg.default($0)
    $2 = aten::detach.default($1)
    $3 = aten::zeros.default([2], device=device(type='cpu'))
    ");
}

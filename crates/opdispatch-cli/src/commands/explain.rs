use crate::support::{
    dispatcher_or_exit, load_config_or_exit, operand_or_exit, print_json, render_value,
};
use opdispatch_core::{CallLog, ModeSource, PushOptions, Value};
use serde_json::json;

pub fn run(
    op: String,
    operands: Vec<String>,
    mode: Option<String>,
    execute: bool,
    config: Option<String>,
    json_output: bool,
) {
    let config = load_config_or_exit(config.as_deref());
    let dispatcher = dispatcher_or_exit(&config);
    let args: Vec<Value> = operands.iter().map(|d| operand_or_exit(d)).collect();

    let log = CallLog::new();
    let _guard = match mode.as_deref() {
        None => None,
        Some("logging") => Some(
            dispatcher
                .enter_mode(ModeSource::instance(log.mode()), PushOptions::default())
                .unwrap_or_else(|e| {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }),
        ),
        Some(other) => {
            eprintln!("error: unknown mode `{other}`; supported: logging");
            std::process::exit(1);
        }
    };

    let call = dispatcher.bind(&op, args, vec![]).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    let plan = dispatcher.plan(&call).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    tracing::debug!(
        op = %plan.operator,
        candidates = plan.candidates.len(),
        execute,
        "resolved plan"
    );

    let outcome = execute.then(|| dispatcher.call_bound(call));
    let (result, error) = match &outcome {
        Some(Ok(value)) => (Some(render_value(value)), None),
        Some(Err(e)) => (None, Some(e.to_string())),
        None => (None, None),
    };

    if json_output {
        print_json(&json!({
            "plan": plan,
            "modes": dispatcher.mode_names(),
            "executed": execute,
            "result": result,
            "error": error,
            "log": log.lines(),
        }));
    } else {
        println!("opdispatch explain {}", plan.operator);
        let keys: Vec<String> = plan.keys.iter().map(ToString::to_string).collect();
        println!("  Keys: [{}]", keys.join(", "));
        if plan.candidates.is_empty() {
            println!("  Candidates: none");
        } else {
            println!("  Candidates:");
            for step in &plan.candidates {
                println!("    - {} {:?} {}", step.key, step.handler, step.name);
            }
        }
        match &plan.selected {
            Some(step) => println!("  Selected: {}", step.name),
            None => println!("  Selected: none (unimplemented)"),
        }
        if let Some(result) = &result {
            println!("  Result: {result}");
        }
        if let Some(error) = &error {
            println!("  Error: {error}");
        }
        if !log.is_empty() {
            println!("  Log:");
            for line in log.lines() {
                println!("    {line}");
            }
        }
    }

    if error.is_some() {
        std::process::exit(1);
    }
}

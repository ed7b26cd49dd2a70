use crate::support::print_json;
use opdispatch_core::OperatorSchema;
use serde_json::json;

pub fn run(text: String, json_output: bool) {
    let schema = OperatorSchema::parse(&text).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });

    if json_output {
        print_json(&json!({
            "canonical": schema.to_string(),
            "mutating": schema.is_mutating(),
            "differentiable": schema.is_differentiable(),
            "schema": schema,
        }));
    } else {
        println!("{schema}");
        println!("  Operator: {}", schema.name);
        println!("  Returns: {}", schema.returns_display());
        println!("  Mutating: {}", yes_no(schema.is_mutating()));
        println!("  Differentiable: {}", yes_no(schema.is_differentiable()));
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

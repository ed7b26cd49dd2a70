use crate::support::print_json;
use opdispatch_core::{Registry, TableRow};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperatorRow {
    name: String,
    schema: String,
    rows: Vec<TableRow>,
}

pub fn run(json_output: bool) {
    let registry = Registry::new();
    let mut operators: Vec<OperatorRow> = Vec::new();
    for schema in registry.operators() {
        let table = registry.dispatch_table(&schema.name).unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        });
        operators.push(OperatorRow {
            name: schema.name.to_string(),
            schema: schema.to_string(),
            rows: table.rows(),
        });
    }
    operators.sort_by(|a, b| a.name.cmp(&b.name));

    if json_output {
        print_json(&serde_json::json!({
            "fingerprint": registry.fingerprint(),
            "operators": operators,
        }));
    } else {
        println!("opdispatch ops ({} registered)", operators.len());
        for op in &operators {
            let keys: Vec<String> = op.rows.iter().map(|row| row.key.to_string()).collect();
            println!("  {}  [{}]", op.schema, keys.join(", "));
        }
    }
}

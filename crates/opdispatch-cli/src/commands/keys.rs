use crate::support::{load_config_or_exit, print_json};
use opdispatch_core::{BackendKey, KeySet};
use serde_json::json;

pub fn run(config: Option<String>, json_output: bool) {
    let config = load_config_or_exit(config.as_deref());
    let order = config.key_order().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    let highest_first = order.descending(KeySet::from_keys(&BackendKey::ALL));

    if json_output {
        let keys: Vec<_> = highest_first
            .iter()
            .map(|key| {
                json!({
                    "key": key,
                    "rank": order.rank(*key),
                    "backend": key.is_backend(),
                    "autograd": key.is_autograd(),
                })
            })
            .collect();
        print_json(&json!({
            "maxDepth": config.max_depth,
            "keys": keys,
        }));
    } else {
        println!("opdispatch keys (highest priority first)");
        println!("  Max depth: {}", config.max_depth);
        for key in &highest_first {
            let role = if key.is_backend() {
                " backend"
            } else if key.is_autograd() {
                " autograd"
            } else {
                ""
            };
            println!("  {:>2}  {key}{role}", order.rank(*key));
        }
    }
}

use opdispatch_core::{DispatchConfig, Dispatcher, Device, Registry, Tensor, Value};
use serde::Serialize;

/// Values every tensor operand is built from.
const OPERAND_VALUES: [f64; 2] = [1.0, -2.0];

pub fn load_config_or_exit(path: Option<&str>) -> DispatchConfig {
    let Some(path) = path else {
        return DispatchConfig::default();
    };
    DispatchConfig::load(path).unwrap_or_else(|e| {
        eprintln!("error: failed to load {path}: {e}");
        std::process::exit(1);
    })
}

pub fn dispatcher_or_exit(config: &DispatchConfig) -> Dispatcher {
    Dispatcher::with_config(Registry::new(), config).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    })
}

pub fn operand_or_exit(descriptor: &str) -> Value {
    parse_operand(descriptor).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    })
}

/// `device[:flag]...` with flags `grad`, `neg`, `zero`; or an int or float
/// literal.
fn parse_operand(descriptor: &str) -> Result<Value, String> {
    if let Ok(int) = descriptor.parse::<i64>() {
        return Ok(Value::Int(int));
    }
    if let Ok(float) = descriptor.parse::<f64>() {
        return Ok(Value::Float(float));
    }

    let mut parts = descriptor.split(':');
    let device = match parts.next().unwrap_or_default() {
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda,
        "meta" => Device::Meta,
        other => {
            return Err(format!(
                "unknown operand device `{other}` in `{descriptor}`; use cpu, cuda, or meta"
            ));
        }
    };

    let (mut grad, mut neg, mut zero) = (false, false, false);
    for flag in parts {
        match flag {
            "grad" => grad = true,
            "neg" => neg = true,
            "zero" => zero = true,
            other => return Err(format!("unknown operand flag `{other}` in `{descriptor}`")),
        }
    }
    if zero && device == Device::Meta {
        return Err(format!("`{descriptor}`: meta operands carry no values to zero"));
    }

    let shape = [OPERAND_VALUES.len()];
    let mut tensor = if device == Device::Meta {
        Tensor::meta(&shape)
    } else if zero {
        Tensor::efficient_zeros(&shape).on(device)
    } else {
        Tensor::from_vec(OPERAND_VALUES.to_vec()).on(device)
    };
    if neg {
        tensor = tensor.neg_view();
    }
    Ok(Value::Tensor(tensor.with_requires_grad(grad)))
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) => format!("{x:?}"),
        Value::Str(s) => format!("'{s}'"),
        Value::IntList(items) => format!("{items:?}"),
        Value::Device(device) => device.to_string(),
        Value::Tensor(t) => t.to_string(),
        Value::TensorList(items) => {
            let parts: Vec<String> = items.iter().map(Tensor::to_string).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(render_value).collect();
            format!("({})", parts.join(", "))
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(payload: &T) {
    let rendered = serde_json::to_string_pretty(payload).unwrap_or_else(|err| {
        eprintln!("error: failed to render json output: {err}");
        std::process::exit(1);
    });
    println!("{rendered}");
}

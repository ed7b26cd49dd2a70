use serde_json::Value;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    fn new(prefix: &str) -> Self {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "opdispatch-cli-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("temp dir should be created");
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn run_opdispatch<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = env!("CARGO_BIN_EXE_opdispatch");
    Command::new(bin)
        .args(args)
        .output()
        .expect("opdispatch command should execute")
}

fn assert_success(output: &Output) {
    if !output.status.success() {
        panic!(
            "command failed with status {:?}\nstdout:\n{}\nstderr:\n{}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn assert_failure(output: &Output) {
    if output.status.success() {
        panic!(
            "command unexpectedly succeeded\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn parse_json_stdout(output: &Output) -> Value {
    serde_json::from_slice::<Value>(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout should be valid json: {e}\nstdout:\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn key_names(payload: &Value) -> Vec<String> {
    payload["keys"]
        .as_array()
        .expect("keys should be an array")
        .iter()
        .map(|entry| entry["key"].as_str().expect("key name").to_string())
        .collect()
}

#[test]
fn keys_json_lists_the_default_table_highest_first() {
    let output = run_opdispatch(["keys", "--json"]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);

    assert_eq!(payload["maxDepth"], 64);
    assert_eq!(
        key_names(&payload),
        vec![
            "AutogradCPU",
            "AutogradCUDA",
            "AutogradMeta",
            "ZeroTensor",
            "Negative",
            "Python",
            "CPU",
            "CUDA",
            "Meta",
        ]
    );
    assert_eq!(payload["keys"][0]["autograd"], true);
    assert_eq!(payload["keys"][6]["backend"], true);
}

#[test]
fn keys_reads_a_config_file() {
    let tmp = TempDirGuard::new("keys-config");
    let config = tmp.path().join("dispatch.toml");
    fs::write(
        &config,
        r#"max_depth = 16
key_order = ["Meta", "CUDA", "CPU", "Python", "ZeroTensor", "Negative",
             "AutogradMeta", "AutogradCUDA", "AutogradCPU"]
"#,
    )
    .expect("config should be written");

    let output = run_opdispatch([
        "keys".as_ref(),
        "--config".as_ref(),
        config.as_os_str(),
        "--json".as_ref(),
    ]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);
    assert_eq!(payload["maxDepth"], 16);
    let names = key_names(&payload);
    assert_eq!(names[3], "Negative");
    assert_eq!(names[4], "ZeroTensor");
}

#[test]
fn keys_rejects_an_incomplete_order() {
    let tmp = TempDirGuard::new("keys-bad");
    let config = tmp.path().join("dispatch.toml");
    fs::write(&config, "key_order = [\"CPU\", \"CPU\"]\n").expect("config should be written");

    let output = run_opdispatch([
        "keys".as_ref(),
        "--config".as_ref(),
        config.as_os_str(),
    ]);
    assert_failure(&output);
    assert!(stderr_text(&output).starts_with("error:"));
}

#[test]
fn keys_text_output_names_roles() {
    let output = run_opdispatch(["keys"]);
    assert_success(&output);
    let text = stdout_text(&output);
    assert!(text.contains("opdispatch keys (highest priority first)"));
    assert!(text.contains("AutogradCPU autograd"));
    assert!(text.contains("CPU backend"));
}

#[test]
fn schema_json_reports_properties() {
    let output = run_opdispatch([
        "schema",
        "foo::sum(Tensor[] xs) -> Tensor",
        "--json",
    ]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);
    assert_eq!(payload["schema"]["name"]["namespace"], "foo");
    assert_eq!(payload["schema"]["name"]["name"], "sum");
    assert_eq!(payload["mutating"], false);
    assert_eq!(payload["differentiable"], true);

    let output = run_opdispatch([
        "schema",
        "foo::bump_(Tensor(a!) self) -> Tensor(a!)",
        "--json",
    ]);
    assert_success(&output);
    assert_eq!(parse_json_stdout(&output)["mutating"], true);
}

#[test]
fn schema_rejects_unqualified_names() {
    let output = run_opdispatch(["schema", "sum(Tensor self) -> Tensor"]);
    assert_failure(&output);
    assert!(stderr_text(&output).contains("namespace-qualified"));
}

#[test]
fn ops_json_lists_builtin_kernels() {
    let output = run_opdispatch(["ops", "--json"]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);

    let fingerprint = payload["fingerprint"].as_str().expect("fingerprint");
    assert_eq!(fingerprint.len(), 64);

    let operators = payload["operators"].as_array().expect("operators");
    let mul = operators
        .iter()
        .find(|op| op["name"] == "aten::mul.Tensor")
        .expect("mul.Tensor should be listed");
    let rows = mul["rows"].as_array().expect("rows");
    assert!(rows.iter().any(|row| row["key"] == "CPU" && row["kind"] == "kernel"));
    assert!(rows.iter().any(|row| row["key"] == "Negative" && row["kind"] == "fallback"));
    assert!(rows.iter().all(|row| row["provenance"] == "builtin"));
}

#[test]
fn explain_json_selects_the_highest_handler() {
    let output = run_opdispatch([
        "explain",
        "aten::mul.Tensor",
        "--operand",
        "cpu:grad:neg",
        "--operand",
        "cpu",
        "--json",
    ]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);
    assert_eq!(payload["plan"]["operator"], "aten::mul.Tensor");
    assert_eq!(
        payload["plan"]["keys"],
        serde_json::json!(["AutogradCPU", "Negative", "CPU"])
    );
    assert_eq!(payload["plan"]["selected"]["name"], "autograd[AutogradCPU]");
    assert_eq!(payload["executed"], false);
}

#[test]
fn explain_run_reports_unimplemented_backends() {
    let output = run_opdispatch(["explain", "aten::neg", "--operand", "cuda", "--run"]);
    assert_failure(&output);
    let text = stdout_text(&output);
    assert!(text.contains("Selected: none (unimplemented)"));
    assert!(text.contains("CUDA"));
}

#[test]
fn explain_with_logging_mode_records_the_call() {
    let output = run_opdispatch([
        "explain",
        "aten::neg",
        "--operand",
        "cpu",
        "--mode",
        "logging",
        "--run",
        "--json",
    ]);
    assert_success(&output);
    let payload = parse_json_stdout(&output);
    assert_eq!(payload["plan"]["selected"]["handler"], "mode");
    assert_eq!(payload["plan"]["selected"]["name"], "LoggingMode");
    assert_eq!(payload["result"], "tensor([-1.0, 2.0])");
    assert_eq!(
        payload["log"],
        serde_json::json!(["$1 = aten::neg.default($0)"])
    );
}

#[test]
fn explain_rejects_unknown_modes_and_operands() {
    let output = run_opdispatch(["explain", "aten::neg", "--operand", "tpu"]);
    assert_failure(&output);
    assert!(stderr_text(&output).contains("unknown operand device"));

    let output = run_opdispatch([
        "explain",
        "aten::neg",
        "--operand",
        "cpu",
        "--mode",
        "profiling",
    ]);
    assert_failure(&output);
    assert!(stderr_text(&output).contains("unknown mode"));
}

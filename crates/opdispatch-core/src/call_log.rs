//! Recording of dispatched calls, as a wrapper subclass or as a mode.
//!
//! Each tensor seen by a [`CallLog`] gets a stable `$n` handle the first time
//! it appears. A record reads like `$2 = aten::mul.Tensor($0, $1)`;
//! defaulted arguments are left out.

use crate::engine::DispatchCx;
use crate::error::{DispatchError, DispatchResult};
use crate::mode::{Interceptor, Mode};
use crate::operand::{SubclassType, Tensor, TensorId};
use crate::value::{Call, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct LogState {
    handles: HashMap<TensorId, usize>,
    lines: Vec<String>,
}

impl LogState {
    fn handle(&mut self, tensor: &Tensor) -> String {
        let next = self.handles.len();
        let index = *self.handles.entry(tensor.id()).or_insert(next);
        format!("${index}")
    }

    fn render(&mut self, value: &Value) -> String {
        match value {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(x) => format!("{x:?}"),
            Value::Str(s) => format!("'{s}'"),
            Value::IntList(items) => format!("{items:?}"),
            Value::Device(device) => format!("device(type='{device}')"),
            Value::Tensor(t) => self.handle(t),
            Value::TensorList(items) => {
                let parts: Vec<String> = items.iter().map(|t| self.handle(t)).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|item| self.render(item)).collect();
                format!("({})", parts.join(", "))
            }
        }
    }
}

/// A shared, append-only log of dispatched calls.
#[derive(Clone, Default)]
pub struct CallLog {
    state: Arc<Mutex<LogState>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name an input tensor: `$0 = input('x')`.
    pub fn log_input(&self, label: &str, tensor: &Tensor) {
        let mut state = self.lock();
        let handle = state.handle(tensor);
        let line = format!("{handle} = input('{label}')");
        tracing::debug!(%line, "call log");
        state.lines.push(line);
    }

    /// Append one record for `call` producing `out`.
    pub fn record(&self, call: &Call, out: &Value) {
        let mut state = self.lock();
        let mut args: Vec<String> = call.args().iter().map(|arg| state.render(arg)).collect();
        for (name, value) in call.kwargs() {
            let rendered = state.render(&value);
            args.push(format!("{name}={rendered}"));
        }
        let invocation = format!("{}({})", call.op(), args.join(", "));
        let line = match out {
            Value::None => invocation,
            other => format!("{} = {invocation}", state.render(other)),
        };
        tracing::debug!(%line, "call log");
        state.lines.push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    pub fn render(&self) -> String {
        self.lock().lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// A `LoggingTensor` wrapper subclass whose handler records every call
    /// on its instances into this log.
    pub fn subclass(&self) -> DispatchResult<SubclassType> {
        let log = self.clone();
        SubclassType::builder("LoggingTensor")
            .wrapper()
            .handler(move |cx: &DispatchCx<'_>, call: &Call| log.forward(cx, call))
            .build()
    }

    /// A mode recording every call resolved beneath it.
    pub fn mode(&self) -> LoggingMode {
        LoggingMode { log: self.clone() }
    }

    fn forward(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        let ty = cx
            .subclass()
            .cloned()
            .ok_or_else(|| DispatchError::handler("LoggingTensor", "invoked outside a subclass handler"))?;
        let wrapped: Vec<(Tensor, Tensor)> = call
            .tensors()
            .into_iter()
            .filter(|t| t.subclass() == Some(&ty))
            .map(|t| (t.clone(), t.unwrap_subclass(&ty)))
            .collect();

        let out = cx.call_bound(call.map_tensors(|t| t.unwrap_subclass(&ty)))?;
        let out = out.try_map_tensors(|t| {
            if let Some((wrapper, _)) = wrapped.iter().find(|(_, inner)| inner.is_same(t)) {
                return Ok(wrapper.clone());
            }
            Tensor::make_wrapper(&ty, t.clone())
        })?;
        self.record(call, &out);
        Ok(out)
    }
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog")
            .field("lines", &self.lock().lines.len())
            .finish()
    }
}

pub struct LoggingMode {
    log: CallLog,
}

impl LoggingMode {
    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

impl Interceptor for LoggingMode {
    fn intercept(&self, cx: &DispatchCx<'_>, call: &Call) -> DispatchResult<Value> {
        let out = cx.call_bound(call.clone())?;
        self.log.record(call, &out);
        Ok(out)
    }
}

impl Mode for LoggingMode {}

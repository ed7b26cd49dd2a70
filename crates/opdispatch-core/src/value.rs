//! Argument and result values, and calls bound to a schema.

use crate::error::{DispatchError, DispatchResult};
use crate::operand::{Device, SubclassType, Tensor};
use crate::schema::{ArgType, OperatorName, OperatorSchema};
use std::sync::Arc;

/// A dynamically typed argument or result.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    Device(Device),
    Tensor(Tensor),
    TensorList(Vec<Tensor>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::IntList(_) => "int[]",
            Self::Device(_) => "Device",
            Self::Tensor(_) => "Tensor",
            Self::TensorList(_) => "Tensor[]",
            Self::Tuple(_) => "tuple",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn into_tensor(self, op: &str) -> DispatchResult<Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            other => Err(DispatchError::invalid_operand(
                op,
                format!("expected a Tensor result but got {}", other.type_name()),
            )),
        }
    }

    pub fn into_tensor_list(self, op: &str) -> DispatchResult<Vec<Tensor>> {
        match self {
            Self::TensorList(items) => Ok(items),
            Self::Tuple(items) => items.into_iter().map(|item| item.into_tensor(op)).collect(),
            other => Err(DispatchError::invalid_operand(
                op,
                format!("expected a Tensor[] result but got {}", other.type_name()),
            )),
        }
    }

    /// Every tensor inside this value, depth first.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Self::Tensor(t) => out.push(t),
            Self::TensorList(items) => out.extend(items.iter()),
            Self::Tuple(items) => {
                for item in items {
                    item.collect_tensors(out);
                }
            }
            _ => {}
        }
    }

    /// Rebuild this value with every tensor replaced by `f(tensor)`.
    pub fn map_tensors<F>(&self, mut f: F) -> Value
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        self.map_infallible(&mut f)
    }

    fn map_infallible(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Value {
        match self {
            Self::Tensor(t) => Self::Tensor(f(t)),
            Self::TensorList(items) => Self::TensorList(items.iter().map(|t| f(t)).collect()),
            Self::Tuple(items) => Self::Tuple(items.iter().map(|item| item.map_infallible(f)).collect()),
            other => other.clone(),
        }
    }

    pub fn try_map_tensors<F>(&self, mut f: F) -> DispatchResult<Value>
    where
        F: FnMut(&Tensor) -> DispatchResult<Tensor>,
    {
        self.map_with(&mut f)
    }

    fn map_with<F>(&self, f: &mut F) -> DispatchResult<Value>
    where
        F: FnMut(&Tensor) -> DispatchResult<Tensor>,
    {
        Ok(match self {
            Self::Tensor(t) => Self::Tensor(f(t)?),
            Self::TensorList(items) => {
                Self::TensorList(items.iter().map(&mut *f).collect::<DispatchResult<_>>()?)
            }
            Self::Tuple(items) => Self::Tuple(
                items
                    .iter()
                    .map(|item| item.map_with(f))
                    .collect::<DispatchResult<_>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<&Tensor> for Value {
    fn from(t: &Tensor) -> Self {
        Self::Tensor(t.clone())
    }
}

impl From<Vec<Tensor>> for Value {
    fn from(items: Vec<Tensor>) -> Self {
        Self::TensorList(items)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<Device> for Value {
    fn from(v: Device) -> Self {
        Self::Device(v)
    }
}

/// An operation invocation with its arguments bound to the schema.
///
/// Each schema argument has a slot; unset slots take the declared default.
#[derive(Clone)]
pub struct Call {
    schema: Arc<OperatorSchema>,
    slots: Vec<Option<Value>>,
}

impl Call {
    /// Bind positional and keyword arguments to `schema`.
    pub fn bind(
        schema: Arc<OperatorSchema>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> DispatchResult<Self> {
        let mismatch = |detail: String| DispatchError::SchemaMismatch {
            op: schema.name.to_string(),
            detail,
        };

        let positional_count = schema.positional().count();
        if args.len() > positional_count {
            return Err(mismatch(format!(
                "expected at most {positional_count} positional arguments but got {}",
                args.len()
            )));
        }

        let mut slots: Vec<Option<Value>> = vec![None; schema.arguments.len()];
        let positional_slots = schema
            .arguments
            .iter()
            .enumerate()
            .filter(|(_, arg)| !arg.kwarg_only)
            .map(|(idx, _)| idx);
        for (slot, value) in positional_slots.zip(args) {
            slots[slot] = Some(value);
        }
        for (name, value) in kwargs {
            let (slot, _) = schema
                .argument(&name)
                .ok_or_else(|| mismatch(format!("unexpected keyword argument {name}")))?;
            if slots[slot].is_some() {
                return Err(mismatch(format!("got multiple values for argument {name}")));
            }
            slots[slot] = Some(value);
        }

        for (arg, slot) in schema.arguments.iter().zip(&slots) {
            match slot {
                Some(value) if !arg.accepts(value) => {
                    return Err(mismatch(format!(
                        "argument {} expected {} but got {}",
                        arg.name,
                        arg.ty.as_str(),
                        value.type_name()
                    )));
                }
                None if !arg.has_default() => {
                    return Err(mismatch(format!("missing required argument {}", arg.name)));
                }
                _ => {}
            }
        }

        Ok(Self { schema, slots })
    }

    pub fn schema(&self) -> &Arc<OperatorSchema> {
        &self.schema
    }

    pub fn op(&self) -> &OperatorName {
        &self.schema.name
    }

    /// The explicitly passed value for `name`, if any.
    pub fn provided(&self, name: &str) -> Option<&Value> {
        let (slot, _) = self.schema.argument(name)?;
        self.slots[slot].as_ref()
    }

    /// The effective value for `name`: passed, or the declared default.
    pub fn get(&self, name: &str) -> Option<Value> {
        let (slot, arg) = self.schema.argument(name)?;
        Some(
            self.slots[slot]
                .clone()
                .unwrap_or_else(|| arg.default_value()),
        )
    }

    fn require(&self, name: &str) -> DispatchResult<Value> {
        self.get(name).ok_or_else(|| DispatchError::SchemaMismatch {
            op: self.op().to_string(),
            detail: format!("no argument named {name}"),
        })
    }

    fn wrong_type(&self, name: &str, expected: &str, found: &Value) -> DispatchError {
        DispatchError::SchemaMismatch {
            op: self.op().to_string(),
            detail: format!(
                "argument {name} expected {expected} but got {}",
                found.type_name()
            ),
        }
    }

    pub fn tensor(&self, name: &str) -> DispatchResult<Tensor> {
        match self.require(name)? {
            Value::Tensor(t) => Ok(t),
            other => Err(self.wrong_type(name, "Tensor", &other)),
        }
    }

    pub fn optional_tensor(&self, name: &str) -> DispatchResult<Option<Tensor>> {
        match self.require(name)? {
            Value::Tensor(t) => Ok(Some(t)),
            Value::None => Ok(None),
            other => Err(self.wrong_type(name, "Tensor?", &other)),
        }
    }

    pub fn tensor_list(&self, name: &str) -> DispatchResult<Vec<Tensor>> {
        let value = self.require(name)?;
        let found = value.type_name();
        value.into_tensor_list(&self.op().to_string()).map_err(|_| {
            DispatchError::SchemaMismatch {
                op: self.op().to_string(),
                detail: format!("argument {name} expected Tensor[] but got {found}"),
            }
        })
    }

    pub fn scalar(&self, name: &str) -> DispatchResult<f64> {
        let value = self.require(name)?;
        value
            .as_f64()
            .ok_or_else(|| self.wrong_type(name, "Scalar", &value))
    }

    pub fn int(&self, name: &str) -> DispatchResult<i64> {
        let value = self.require(name)?;
        value
            .as_i64()
            .ok_or_else(|| self.wrong_type(name, "int", &value))
    }

    pub fn int_list(&self, name: &str) -> DispatchResult<Vec<i64>> {
        match self.require(name)? {
            Value::IntList(items) => Ok(items),
            other => Err(self.wrong_type(name, "int[]", &other)),
        }
    }

    pub fn bool(&self, name: &str) -> DispatchResult<bool> {
        match self.require(name)? {
            Value::Bool(b) => Ok(b),
            other => Err(self.wrong_type(name, "bool", &other)),
        }
    }

    pub fn device(&self, name: &str) -> DispatchResult<Option<Device>> {
        match self.require(name)? {
            Value::Device(d) => Ok(Some(d)),
            Value::None => Ok(None),
            other => Err(self.wrong_type(name, "Device?", &other)),
        }
    }

    /// Positional arguments for display: trailing positionals equal to their
    /// defaults are dropped.
    pub fn args(&self) -> Vec<Value> {
        let positional: Vec<(usize, &crate::schema::Argument)> = self
            .schema
            .arguments
            .iter()
            .enumerate()
            .filter(|(_, arg)| !arg.kwarg_only)
            .collect();
        let keep = positional
            .iter()
            .rposition(|(slot, arg)| {
                self.slots[*slot]
                    .as_ref()
                    .is_some_and(|value| !arg.is_default(value))
            })
            .map_or(0, |last| last + 1);
        positional[..keep]
            .iter()
            .map(|(slot, arg)| {
                self.slots[*slot]
                    .clone()
                    .unwrap_or_else(|| arg.default_value())
            })
            .collect()
    }

    /// Keyword-only arguments that differ from their defaults.
    pub fn kwargs(&self) -> Vec<(String, Value)> {
        self.schema
            .arguments
            .iter()
            .zip(&self.slots)
            .filter(|(arg, _)| arg.kwarg_only)
            .filter_map(|(arg, slot)| match slot {
                Some(value) if !arg.is_default(value) => Some((arg.name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Every tensor operand, in argument order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        self.slots
            .iter()
            .flatten()
            .flat_map(Value::tensors)
            .collect()
    }

    /// Distinct subclass types among the operands, in order of appearance.
    pub fn subclass_types(&self) -> Vec<SubclassType> {
        let mut types: Vec<SubclassType> = Vec::new();
        for tensor in self.tensors() {
            if let Some(ty) = tensor.subclass() {
                if !types.contains(ty) {
                    types.push(ty.clone());
                }
            }
        }
        types
    }

    /// Tensors passed for arguments the operation mutates, with their slots.
    pub fn mutable_operands(&self) -> Vec<(usize, Tensor)> {
        self.schema
            .arguments
            .iter()
            .zip(&self.slots)
            .enumerate()
            .filter(|(_, (arg, _))| arg.is_mutable() && arg.ty == ArgType::Tensor)
            .filter_map(|(slot, (_, value))| match value {
                Some(Value::Tensor(t)) => Some((slot, t.clone())),
                _ => None,
            })
            .collect()
    }

    /// The tensor bound to `slot`, if any.
    pub fn tensor_at(&self, slot: usize) -> Option<&Tensor> {
        self.slots.get(slot)?.as_ref()?.as_tensor()
    }

    /// The same call with every tensor operand replaced by `f(tensor)`.
    pub fn map_tensors<F>(&self, mut f: F) -> Call
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        Call {
            schema: Arc::clone(&self.schema),
            slots: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(|value| value.map_tensors(&mut f)))
                .collect(),
        }
    }

    pub fn try_map_tensors<F>(&self, mut f: F) -> DispatchResult<Call>
    where
        F: FnMut(&Tensor) -> DispatchResult<Tensor>,
    {
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|value| value.try_map_tensors(&mut f))
                    .transpose()
            })
            .collect::<DispatchResult<Vec<_>>>()?;
        Ok(Call {
            schema: Arc::clone(&self.schema),
            slots,
        })
    }

    /// The same call with one argument replaced.
    pub fn with_arg(&self, name: &str, value: Value) -> DispatchResult<Call> {
        let (slot, arg) = self
            .schema
            .argument(name)
            .ok_or_else(|| DispatchError::SchemaMismatch {
                op: self.op().to_string(),
                detail: format!("no argument named {name}"),
            })?;
        if !arg.accepts(&value) {
            return Err(self.wrong_type(name, arg.ty.as_str(), &value));
        }
        let mut slots = self.slots.clone();
        slots[slot] = Some(value);
        Ok(Call {
            schema: Arc::clone(&self.schema),
            slots,
        })
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("op", &self.op().to_string())
            .field("args", &self.args())
            .field("kwargs", &self.kwargs())
            .finish()
    }
}

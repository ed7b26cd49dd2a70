//! Operator identity and declared signatures.
//!
//! Schemas are written in the textual form
//! `ns::name.overload(Tensor self, int dim=0, *, Scalar alpha=1) -> Tensor`.
//! A `*` separates positional parameters from keyword-only ones. `Tensor(a!)`
//! marks an argument the operation mutates, `Tensor(a)` one it aliases. A
//! trailing `?` makes a parameter optional, and `[]` makes it a list.

use crate::error::{DispatchError, DispatchResult};
use crate::value::Value;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const DEFAULT_OVERLOAD: &str = "default";

fn operator_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<ns>[A-Za-z_][A-Za-z0-9_]*)::)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?:\.(?P<overload>[A-Za-z_][A-Za-z0-9_]*))?$",
        )
        .expect("operator name regex must compile")
    })
}

fn schema_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<head>[^(]+)\((?P<args>.*)\)\s*->\s*(?P<rets>.+)$")
            .expect("schema regex must compile")
    })
}

fn declaration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<ty>[A-Za-z]+(?:\([a-z]!?\))?(?:\[\d*\])?\??)(?:\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*))?(?:\s*=\s*(?P<default>.+))?$",
        )
        .expect("declaration regex must compile")
    })
}

fn type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<base>[A-Za-z]+)(?:\((?P<alias>[a-z])(?P<bang>!)?\))?(?P<list>\[\d*\])?(?P<opt>\?)?$",
        )
        .expect("type regex must compile")
    })
}

/// Fully qualified operation identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorName {
    pub namespace: String,
    pub name: String,
    pub overload: String,
}

impl OperatorName {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        overload: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            overload: overload.into(),
        }
    }

    /// Parse a fully qualified name; the overload defaults to `default`.
    pub fn parse(text: &str) -> DispatchResult<Self> {
        let reference = OperatorRef::parse(text)?;
        match reference.namespace {
            Some(namespace) => Ok(Self {
                namespace,
                name: reference.name,
                overload: reference
                    .overload
                    .unwrap_or_else(|| DEFAULT_OVERLOAD.to_string()),
            }),
            None => Err(DispatchError::UnknownOperation(format!(
                "{text} (operation names must be namespace-qualified)"
            ))),
        }
    }
}

impl std::fmt::Display for OperatorName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}.{}", self.namespace, self.name, self.overload)
    }
}

/// An operation reference as written by a caller, before resolution
/// against a library's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRef {
    pub namespace: Option<String>,
    pub name: String,
    pub overload: Option<String>,
}

impl OperatorRef {
    pub fn parse(text: &str) -> DispatchResult<Self> {
        let trimmed = text.trim();
        let caps = operator_name_re()
            .captures(trimmed)
            .ok_or_else(|| DispatchError::SchemaMismatch {
                op: trimmed.to_string(),
                detail: "malformed operator name".to_string(),
            })?;
        Ok(Self {
            namespace: caps.name("ns").map(|m| m.as_str().to_string()),
            name: caps["name"].to_string(),
            overload: caps.name("overload").map(|m| m.as_str().to_string()),
        })
    }

    pub fn in_namespace(self, namespace: &str) -> OperatorName {
        OperatorName {
            namespace: self.namespace.unwrap_or_else(|| namespace.to_string()),
            name: self.name,
            overload: self
                .overload
                .unwrap_or_else(|| DEFAULT_OVERLOAD.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgType {
    Tensor,
    TensorList,
    Int,
    IntList,
    Float,
    Scalar,
    Bool,
    Str,
    Device,
}

impl ArgType {
    pub fn is_tensor_like(self) -> bool {
        matches!(self, Self::Tensor | Self::TensorList)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tensor => "Tensor",
            Self::TensorList => "Tensor[]",
            Self::Int => "int",
            Self::IntList => "int[]",
            Self::Float => "float",
            Self::Scalar => "Scalar",
            Self::Bool => "bool",
            Self::Str => "str",
            Self::Device => "Device",
        }
    }

    /// Whether `value` can be passed where this type is declared.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Tensor, Value::Tensor(_)) => true,
            (Self::TensorList, Value::TensorList(_)) => true,
            (Self::TensorList, Value::Tuple(items)) => {
                items.iter().all(|item| matches!(item, Value::Tensor(_)))
            }
            (Self::Int, Value::Int(_)) => true,
            (Self::IntList, Value::IntList(_)) => true,
            (Self::Float, Value::Float(_) | Value::Int(_)) => true,
            (Self::Scalar, Value::Int(_) | Value::Float(_) | Value::Bool(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Str, Value::Str(_)) => true,
            (Self::Device, Value::Device(_)) => true,
            _ => false,
        }
    }

    fn from_base(base: &str, list: bool) -> Option<Self> {
        let ty = match (base, list) {
            ("Tensor", false) => Self::Tensor,
            ("Tensor", true) => Self::TensorList,
            ("int" | "SymInt", false) => Self::Int,
            ("int" | "SymInt", true) => Self::IntList,
            ("float", false) => Self::Float,
            ("Scalar", false) => Self::Scalar,
            ("bool", false) => Self::Bool,
            ("str", false) => Self::Str,
            ("Device", false) => Self::Device,
            _ => return None,
        };
        Some(ty)
    }
}

/// A literal default value written in a schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DefaultValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
}

impl DefaultValue {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        match text {
            "None" => return Some(Self::None),
            "True" => return Some(Self::Bool(true)),
            "False" => return Some(Self::Bool(false)),
            _ => {}
        }
        if let Ok(int) = text.parse::<i64>() {
            return Some(Self::Int(int));
        }
        if let Ok(float) = text.parse::<f64>() {
            return Some(Self::Float(float));
        }
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            let items: Result<Vec<i64>, _> = inner
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::parse::<i64>)
                .collect();
            return items.ok().map(Self::IntList);
        }
        let quoted = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')));
        quoted.map(|s| Self::Str(s.to_string()))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(f) => Value::Float(*f),
            Self::Str(s) => Value::Str(s.clone()),
            Self::IntList(items) => Value::IntList(items.clone()),
        }
    }

    /// Whether an explicitly passed value equals this default.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::None, Value::None) => true,
            (Self::Bool(a), Value::Bool(b)) => a == b,
            (Self::Int(a), Value::Int(b)) => a == b,
            (Self::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Self::Float(a), Value::Float(b)) => a == b,
            (Self::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Self::Str(a), Value::Str(b)) => a == b,
            (Self::IntList(a), Value::IntList(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::IntList(items) => {
                let parts: Vec<String> = items.iter().map(i64::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Aliasing annotation on an argument or return: `(a)` or `(a!)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasInfo {
    pub set: char,
    pub is_write: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub name: String,
    pub ty: ArgType,
    pub optional: bool,
    pub kwarg_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
}

impl Argument {
    pub fn is_mutable(&self) -> bool {
        self.alias.as_ref().is_some_and(|alias| alias.is_write)
    }

    /// Whether the caller may leave this argument out.
    pub fn has_default(&self) -> bool {
        self.default.is_some() || self.optional
    }

    pub fn accepts(&self, value: &Value) -> bool {
        (self.optional && matches!(value, Value::None)) || self.ty.accepts(value)
    }

    pub fn default_value(&self) -> Value {
        self.default
            .as_ref()
            .map(DefaultValue::to_value)
            .unwrap_or(Value::None)
    }

    /// Whether `value` equals what the argument would be if omitted.
    pub fn is_default(&self, value: &Value) -> bool {
        match &self.default {
            Some(default) => default.matches(value),
            None => self.optional && matches!(value, Value::None),
        }
    }
}

impl std::fmt::Display for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_type(f, self.ty, self.alias.as_ref(), self.optional)?;
        write!(f, " {}", self.name)?;
        if let Some(default) = &self.default {
            write!(f, "={default}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Return {
    pub ty: ArgType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasInfo>,
}

impl std::fmt::Display for Return {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_type(f, self.ty, self.alias.as_ref(), false)
    }
}

fn write_type(
    f: &mut std::fmt::Formatter<'_>,
    ty: ArgType,
    alias: Option<&AliasInfo>,
    optional: bool,
) -> std::fmt::Result {
    let (base, list) = match ty {
        ArgType::TensorList => ("Tensor", true),
        ArgType::IntList => ("int", true),
        other => (other.as_str(), false),
    };
    f.write_str(base)?;
    if let Some(alias) = alias {
        write!(f, "({}{})", alias.set, if alias.is_write { "!" } else { "" })?;
    }
    if list {
        f.write_str("[]")?;
    }
    if optional {
        f.write_str("?")?;
    }
    Ok(())
}

/// A declared operation signature. Immutable once defined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSchema {
    pub name: OperatorName,
    pub arguments: Vec<Argument>,
    pub returns: Vec<Return>,
}

impl OperatorSchema {
    /// Parse a schema whose name must be namespace-qualified.
    pub fn parse(text: &str) -> DispatchResult<Self> {
        let (reference, arguments, returns) = parse_parts(text)?;
        let Some(namespace) = reference.namespace.clone() else {
            return Err(schema_error(text, "schema name must be namespace-qualified"));
        };
        Ok(Self {
            name: reference.in_namespace(&namespace),
            arguments,
            returns,
        })
    }

    /// Parse a schema defined inside a library for `namespace`. An explicit
    /// namespace in the text must agree with it.
    pub fn parse_in(text: &str, namespace: &str) -> DispatchResult<Self> {
        let (reference, arguments, returns) = parse_parts(text)?;
        match &reference.namespace {
            Some(explicit) if explicit != namespace => {
                return Err(DispatchError::NamespaceMismatch {
                    op: text.trim().to_string(),
                    found: explicit.clone(),
                    expected: namespace.to_string(),
                });
            }
            _ => {}
        }
        Ok(Self {
            name: reference.in_namespace(namespace),
            arguments,
            returns,
        })
    }

    pub fn argument(&self, name: &str) -> Option<(usize, &Argument)> {
        self.arguments
            .iter()
            .enumerate()
            .find(|(_, arg)| arg.name == name)
    }

    pub fn positional(&self) -> impl Iterator<Item = &Argument> {
        self.arguments.iter().filter(|arg| !arg.kwarg_only)
    }

    pub fn is_mutating(&self) -> bool {
        self.arguments.iter().any(Argument::is_mutable)
    }

    /// Whether gradients can flow through this operation.
    pub fn is_differentiable(&self) -> bool {
        self.arguments.iter().any(|arg| arg.ty.is_tensor_like())
            && self.returns.iter().any(|ret| ret.ty.is_tensor_like())
    }

    pub fn returns_display(&self) -> String {
        match self.returns.as_slice() {
            [single] => single.to_string(),
            many => {
                let parts: Vec<String> = many.iter().map(Return::to_string).collect();
                format!("({})", parts.join(", "))
            }
        }
    }

    /// Check a handler's result against the declared returns.
    ///
    /// An absent value is accepted where a single tensor is declared, and
    /// tuples of tensors are accepted where a tensor list is declared.
    pub fn coerce_return(&self, value: Value) -> DispatchResult<Value> {
        match self.returns.as_slice() {
            [] => match value {
                Value::None => Ok(Value::None),
                Value::Tuple(items) if items.is_empty() => Ok(Value::None),
                other => Err(self.return_error(&other)),
            },
            [single] => self.coerce_single(single.ty, value),
            many => match value {
                Value::Tuple(items) if items.len() == many.len() => items
                    .into_iter()
                    .zip(many)
                    .map(|(item, ret)| self.coerce_single(ret.ty, item))
                    .collect::<DispatchResult<Vec<_>>>()
                    .map(Value::Tuple),
                other => Err(self.return_error(&other)),
            },
        }
    }

    fn coerce_single(&self, ty: ArgType, value: Value) -> DispatchResult<Value> {
        match (ty, value) {
            (ArgType::Tensor, value @ (Value::Tensor(_) | Value::None)) => Ok(value),
            (ArgType::TensorList, value @ Value::TensorList(_)) => Ok(value),
            (ArgType::TensorList, Value::Tuple(items))
                if items.iter().all(|item| matches!(item, Value::Tensor(_))) =>
            {
                Ok(Value::TensorList(
                    items
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Tensor(t) => Some(t),
                            _ => None,
                        })
                        .collect(),
                ))
            }
            (ArgType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (ty, value) if ty.accepts(&value) => Ok(value),
            (_, other) => Err(self.return_error(&other)),
        }
    }

    fn return_error(&self, found: &Value) -> DispatchError {
        DispatchError::UnrecognizedReturnType {
            op: self.name.to_string(),
            expected: self.returns_display(),
            found: found.type_name().to_string(),
        }
    }
}

impl std::fmt::Display for OperatorSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.name.namespace, self.name.name)?;
        if self.name.overload != DEFAULT_OVERLOAD {
            write!(f, ".{}", self.name.overload)?;
        }
        let mut parts: Vec<String> = Vec::with_capacity(self.arguments.len() + 1);
        let mut star_written = false;
        for arg in &self.arguments {
            if arg.kwarg_only && !star_written {
                parts.push("*".to_string());
                star_written = true;
            }
            parts.push(arg.to_string());
        }
        let returns = if self.returns.is_empty() {
            "()".to_string()
        } else {
            self.returns_display()
        };
        write!(f, "({}) -> {}", parts.join(", "), returns)
    }
}

fn schema_error(text: &str, detail: impl Into<String>) -> DispatchError {
    DispatchError::SchemaMismatch {
        op: text.trim().to_string(),
        detail: detail.into(),
    }
}

type SchemaParts = (OperatorRef, Vec<Argument>, Vec<Return>);

fn parse_parts(text: &str) -> DispatchResult<SchemaParts> {
    let trimmed = text.trim();
    let caps = schema_re()
        .captures(trimmed)
        .ok_or_else(|| schema_error(text, "expected `name(args) -> returns`"))?;
    let reference = OperatorRef::parse(caps["head"].trim())
        .map_err(|_| schema_error(text, "malformed operator name"))?;

    let mut arguments: Vec<Argument> = Vec::new();
    let mut kwarg_only = false;
    for piece in split_top_level(&caps["args"]) {
        if piece == "*" {
            if kwarg_only {
                return Err(schema_error(text, "`*` may appear only once"));
            }
            kwarg_only = true;
            continue;
        }
        let arg = parse_argument(text, piece, kwarg_only)?;
        if arguments.iter().any(|existing| existing.name == arg.name) {
            return Err(schema_error(
                text,
                format!("argument {} is declared twice", arg.name),
            ));
        }
        if !arg.kwarg_only
            && !arg.has_default()
            && arguments.iter().any(|a| !a.kwarg_only && a.has_default())
        {
            return Err(schema_error(
                text,
                format!("positional argument {} without a default follows a defaulted one", arg.name),
            ));
        }
        arguments.push(arg);
    }

    let returns = parse_returns(text, caps["rets"].trim())?;
    Ok((reference, arguments, returns))
}

fn parse_argument(text: &str, piece: &str, kwarg_only: bool) -> DispatchResult<Argument> {
    let caps = declaration_re()
        .captures(piece)
        .ok_or_else(|| schema_error(text, format!("malformed argument `{piece}`")))?;
    let name = caps
        .name("name")
        .ok_or_else(|| schema_error(text, format!("argument `{piece}` has no name")))?
        .as_str()
        .to_string();
    let (ty, alias, optional) = parse_type(text, &caps["ty"])?;
    let default = match caps.name("default") {
        Some(raw) => {
            let parsed = DefaultValue::parse(raw.as_str()).ok_or_else(|| {
                schema_error(text, format!("unsupported default `{}`", raw.as_str()))
            })?;
            if !matches!(parsed, DefaultValue::None) && !ty.accepts(&parsed.to_value()) {
                return Err(schema_error(
                    text,
                    format!("default for {name} does not match its type"),
                ));
            }
            Some(parsed)
        }
        None => None,
    };
    Ok(Argument {
        name,
        ty,
        optional,
        kwarg_only,
        alias,
        default,
    })
}

fn parse_returns(text: &str, rets: &str) -> DispatchResult<Vec<Return>> {
    let inner = match rets.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => inner,
        None => rets,
    };
    split_top_level(inner)
        .into_iter()
        .map(|piece| {
            let caps = declaration_re()
                .captures(piece)
                .filter(|caps| caps.name("default").is_none())
                .ok_or_else(|| schema_error(text, format!("malformed return `{piece}`")))?;
            let (ty, alias, optional) = parse_type(text, &caps["ty"])?;
            if optional {
                return Err(schema_error(text, "optional returns are not supported"));
            }
            Ok(Return { ty, alias })
        })
        .collect()
}

fn parse_type(text: &str, raw: &str) -> DispatchResult<(ArgType, Option<AliasInfo>, bool)> {
    let caps = type_re()
        .captures(raw)
        .ok_or_else(|| schema_error(text, format!("malformed type `{raw}`")))?;
    let ty = ArgType::from_base(&caps["base"], caps.name("list").is_some())
        .ok_or_else(|| schema_error(text, format!("unknown type `{raw}`")))?;
    let alias = caps.name("alias").and_then(|m| m.as_str().chars().next()).map(|set| AliasInfo {
        set,
        is_write: caps.name("bang").is_some(),
    });
    Ok((ty, alias, caps.name("opt").is_some()))
}

/// Split on commas that are not nested inside brackets or parentheses.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in list.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pieces.push(list[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    pieces.push(list[start..].trim());
    pieces.retain(|piece| !piece.is_empty());
    pieces
}

//! Built-in functions for Tessera expressions
//!
//! Expressions can call only the functions registered here; user-defined
//! `<q:function>`s are reached through `<q:invoke>`. Calls are validated
//! against this registry at parse time.

use crate::types::{coerce, format_datetime, Number, TypeHint, Value};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Function signature
pub type BuiltinFunction = fn(&[Value]) -> Result<Value>;

/// Function registry
pub struct FunctionRegistry {
    functions: HashMap<String, BuiltinFunction>,
}

impl FunctionRegistry {
    /// Create a new function registry with all built-in functions
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };

        // String functions
        registry.register("upper", fn_upper);
        registry.register("lower", fn_lower);
        registry.register("trim", fn_trim);
        registry.register("replace", fn_replace);
        registry.register("split", fn_split);
        registry.register("join", fn_join);

        // Collection functions
        registry.register("len", fn_len);
        registry.register("contains", fn_contains);
        registry.register("keys", fn_keys);

        // Numeric functions
        registry.register("abs", fn_abs);
        registry.register("round", fn_round);
        registry.register("floor", fn_floor);
        registry.register("ceil", fn_ceil);
        registry.register("min", fn_min);
        registry.register("max", fn_max);
        registry.register("sum", fn_sum);

        // Date/Time functions
        registry.register("now", fn_now);
        registry.register("dateformat", fn_dateformat);

        // Presence
        registry.register("isdefined", fn_isdefined);
        registry.register("default", fn_default);

        // Encoding functions
        registry.register("jsonencode", fn_jsonencode);
        registry.register("jsondecode", fn_jsondecode);
        registry.register("urlencode", fn_urlencode);
        registry.register("base64encode", fn_base64encode);
        registry.register("base64decode", fn_base64decode);

        registry
    }

    /// Register a function
    pub fn register(&mut self, name: &str, func: BuiltinFunction) {
        self.functions.insert(name.to_string(), func);
    }

    /// Call a function
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.functions.get(&name.to_ascii_lowercase()) {
            Some(func) => func(args),
            None => Err(anyhow!("Unknown function: {}", name)),
        }
    }

    /// Check if a function exists
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_ascii_lowercase())
    }

    /// List all function names, sorted
    pub fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn registry() -> &'static FunctionRegistry {
    static GLOBAL_REGISTRY: OnceLock<FunctionRegistry> = OnceLock::new();
    GLOBAL_REGISTRY.get_or_init(FunctionRegistry::new)
}

/// Call a built-in function by name
pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    registry().call(name, args)
}

/// Whether `name` is a registered builtin
pub fn is_builtin(name: &str) -> bool {
    registry().has_function(name)
}

/// Builtins that receive undefined arguments instead of short-circuiting
pub fn accepts_undefined(name: &str) -> bool {
    name.eq_ignore_ascii_case("isdefined") || name.eq_ignore_ascii_case("default")
}

// =============================================================================
// STRING FUNCTIONS
// =============================================================================

fn fn_upper(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "upper")?;
    Ok(Value::String(args[0].to_string().to_uppercase()))
}

fn fn_lower(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "lower")?;
    Ok(Value::String(args[0].to_string().to_lowercase()))
}

fn fn_trim(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "trim")?;
    Ok(Value::String(args[0].to_string().trim().to_string()))
}

fn fn_replace(args: &[Value]) -> Result<Value> {
    require_args(args, 3, "replace")?;
    let s = args[0].to_string();
    let old = args[1].to_string();
    if old.is_empty() {
        return Ok(Value::String(s));
    }
    Ok(Value::String(s.replace(&old, &args[2].to_string())))
}

fn fn_split(args: &[Value]) -> Result<Value> {
    require_args_range(args, 1, 2, "split")?;
    let s = args[0].to_string();
    let sep = args.get(1).map(Value::to_string).unwrap_or_else(|| ",".to_string());
    if s.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    let parts = if sep.is_empty() {
        s.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        s.split(sep.as_str())
            .map(|p| Value::String(p.to_string()))
            .collect()
    };
    Ok(Value::Array(parts))
}

fn fn_join(args: &[Value]) -> Result<Value> {
    require_args_range(args, 1, 2, "join")?;
    let list = as_list(&args[0], "join")?;
    let sep = args.get(1).map(Value::to_string).unwrap_or_else(|| ",".to_string());
    let strings: Vec<String> = list.iter().map(Value::to_string).collect();
    Ok(Value::String(strings.join(&sep)))
}

// =============================================================================
// COLLECTION FUNCTIONS
// =============================================================================

fn fn_len(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "len")?;
    let len = match &args[0] {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        other => other.to_string().chars().count(),
    };
    Ok(Value::Integer(len as i64))
}

fn fn_contains(args: &[Value]) -> Result<Value> {
    require_args(args, 2, "contains")?;
    let found = match &args[0] {
        Value::Array(items) => items.iter().any(|item| item.loose_eq(&args[1])),
        Value::Object(map) => map.contains_key(&args[1].to_string()),
        other => other.to_string().contains(&args[1].to_string()),
    };
    Ok(Value::Boolean(found))
}

fn fn_keys(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "keys")?;
    match &args[0] {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        other => bail!("keys() expects an object, got {}", other.type_name()),
    }
}

// =============================================================================
// NUMERIC FUNCTIONS
// =============================================================================

fn fn_abs(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "abs")?;
    Ok(match as_number(&args[0], "abs")? {
        Number::Integer(i) => i
            .checked_abs()
            .map(Value::Integer)
            .unwrap_or(Value::Decimal((i as f64).abs())),
        Number::Decimal(d) => Value::Decimal(d.abs()),
    })
}

fn fn_round(args: &[Value]) -> Result<Value> {
    require_args_range(args, 1, 2, "round")?;
    let n = as_number(&args[0], "round")?;
    let digits = match args.get(1) {
        Some(d) => d
            .as_i64()
            .ok_or_else(|| anyhow!("round() digits must be an integer"))?,
        None => 0,
    };
    Ok(match n {
        Number::Integer(i) if digits >= 0 => Value::Integer(i),
        n if digits == 0 => integral(n.as_f64().round()),
        n => {
            let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
            Value::Decimal((n.as_f64() * factor).round() / factor)
        }
    })
}

fn fn_floor(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "floor")?;
    Ok(match as_number(&args[0], "floor")? {
        Number::Integer(i) => Value::Integer(i),
        Number::Decimal(d) => integral(d.floor()),
    })
}

fn fn_ceil(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "ceil")?;
    Ok(match as_number(&args[0], "ceil")? {
        Number::Integer(i) => Value::Integer(i),
        Number::Decimal(d) => integral(d.ceil()),
    })
}

fn fn_min(args: &[Value]) -> Result<Value> {
    extremum(args, "min", std::cmp::Ordering::Less)
}

fn fn_max(args: &[Value]) -> Result<Value> {
    extremum(args, "max", std::cmp::Ordering::Greater)
}

fn fn_sum(args: &[Value]) -> Result<Value> {
    let values = spread(args);
    let mut total = Number::Integer(0);
    for value in &values {
        let n = as_number(value, "sum")?;
        total = match (total, n) {
            (Number::Integer(a), Number::Integer(b)) => a
                .checked_add(b)
                .map(Number::Integer)
                .unwrap_or(Number::Decimal(a as f64 + b as f64)),
            (a, b) => Number::Decimal(a.as_f64() + b.as_f64()),
        };
    }
    Ok(total.into_value())
}

// =============================================================================
// DATE/TIME FUNCTIONS
// =============================================================================

fn fn_now(args: &[Value]) -> Result<Value> {
    require_args(args, 0, "now")?;
    Ok(Value::DateTime(Utc::now()))
}

fn fn_dateformat(args: &[Value]) -> Result<Value> {
    require_args_range(args, 1, 2, "dateformat")?;
    let dt = match coerce(args[0].clone(), TypeHint::DateTime)
        .map_err(|e| anyhow!("dateformat() {}", e))?
    {
        Value::DateTime(dt) => dt,
        other => bail!("dateformat() expects a datetime, got {}", other.type_name()),
    };
    match args.get(1) {
        Some(format) => {
            let format = format.to_string();
            let items: Vec<chrono::format::Item> =
                chrono::format::StrftimeItems::new(&format).collect();
            if items.iter().any(|i| matches!(i, chrono::format::Item::Error)) {
                bail!("dateformat() invalid format '{}'", format);
            }
            Ok(Value::String(dt.format_with_items(items.into_iter()).to_string()))
        }
        None => Ok(Value::String(format_datetime(&dt))),
    }
}

// =============================================================================
// PRESENCE FUNCTIONS
// =============================================================================

fn fn_isdefined(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "isdefined")?;
    Ok(Value::Boolean(!args[0].is_undefined()))
}

fn fn_default(args: &[Value]) -> Result<Value> {
    require_args(args, 2, "default")?;
    if args[0].is_absent() {
        Ok(args[1].clone())
    } else {
        Ok(args[0].clone())
    }
}

// =============================================================================
// ENCODING FUNCTIONS
// =============================================================================

fn fn_jsonencode(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "jsonencode")?;
    Ok(Value::String(serde_json::to_string(&args[0].to_json())?))
}

fn fn_jsondecode(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "jsondecode")?;
    let json: serde_json::Value = serde_json::from_str(&args[0].to_string())
        .map_err(|e| anyhow!("jsondecode() invalid JSON: {}", e))?;
    Ok(Value::from_json(json))
}

fn fn_urlencode(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "urlencode")?;
    Ok(Value::String(
        urlencoding::encode(&args[0].to_string()).into_owned(),
    ))
}

fn fn_base64encode(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "base64encode")?;
    Ok(Value::String(STANDARD.encode(args[0].to_string())))
}

fn fn_base64decode(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "base64decode")?;
    let bytes = STANDARD
        .decode(args[0].to_string())
        .map_err(|e| anyhow!("base64decode() invalid input: {}", e))?;
    Ok(Value::String(String::from_utf8(bytes)?))
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_args(args: &[Value], count: usize, name: &str) -> Result<()> {
    if args.len() != count {
        bail!(
            "{}() expects {} argument{}, got {}",
            name,
            count,
            if count == 1 { "" } else { "s" },
            args.len()
        );
    }
    Ok(())
}

fn require_args_range(args: &[Value], min: usize, max: usize, name: &str) -> Result<()> {
    if args.len() < min || args.len() > max {
        bail!(
            "{}() expects {} to {} arguments, got {}",
            name,
            min,
            max,
            args.len()
        );
    }
    Ok(())
}

fn as_list<'v>(value: &'v Value, name: &str) -> Result<&'v Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("{}() expects an array, got {}", name, value.type_name()))
}

fn as_number(value: &Value, name: &str) -> Result<Number> {
    value
        .as_number()
        .ok_or_else(|| anyhow!("{}() expects a number, got '{}'", name, value))
}

/// A whole float as an integer when it fits
fn integral(d: f64) -> Value {
    if d.is_finite() && d.abs() < 9.0e15 {
        Value::Integer(d as i64)
    } else {
        Value::Decimal(d)
    }
}

/// Arguments, with a single array argument spread into its items
fn spread(args: &[Value]) -> Vec<Value> {
    match args {
        [Value::Array(items)] => items.clone(),
        _ => args.to_vec(),
    }
}

fn extremum(args: &[Value], name: &str, wanted: std::cmp::Ordering) -> Result<Value> {
    let values = spread(args);
    let mut best: Option<(Number, &Value)> = None;
    for value in &values {
        let n = as_number(value, name)?;
        let better = match &best {
            None => true,
            Some((current, _)) => n.as_f64().partial_cmp(&current.as_f64()) == Some(wanted),
        };
        if better {
            best = Some((n, value));
        }
    }
    best.map(|(n, _)| n.into_value())
        .ok_or_else(|| anyhow!("{}() expects at least one value", name))
}

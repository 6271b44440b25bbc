//! Value types: how wire values are coerced into the shape an action
//! expects, and how results are shaped back onto the wire.

use serde_json::{Number, Value};

/// A single coercion step. Cheap to copy.
#[derive(Clone, Copy)]
pub struct Conversion(fn(&Value) -> Value);

impl Conversion {
    pub fn identity() -> Self {
        Conversion(identity)
    }

    pub fn apply(&self, value: &Value) -> Value {
        (self.0)(value)
    }
}

impl std::fmt::Debug for Conversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Conversion")
    }
}

/// A named value type with its two conversions.
#[derive(Debug, Clone, Copy)]
pub struct ValueType {
    pub convert: Conversion,
    pub to_wire: Conversion,
}

impl ValueType {
    pub fn new(convert: fn(&Value) -> Value) -> Self {
        Self {
            convert: Conversion(convert),
            to_wire: Conversion::identity(),
        }
    }

    pub fn with_to_wire(mut self, to_wire: fn(&Value) -> Value) -> Self {
        self.to_wire = Conversion(to_wire);
        self
    }

    pub fn passthrough() -> Self {
        Self::new(identity)
    }
}

fn identity(value: &Value) -> Value {
    value.clone()
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => text(other).trim().parse().ok(),
    }
}

fn number_value(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn to_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        other => Value::Bool(matches!(
            text(other).to_lowercase().as_str(),
            "true" | "yes" | "1"
        )),
    }
}

pub(crate) fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        other => parse_number(other).map(number_value).unwrap_or(Value::Null),
    }
}

pub(crate) fn to_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        other => Value::String(text(other)),
    }
}

/// Numbers clamped to `0..=100`.
pub(crate) fn to_percentage(value: &Value) -> Value {
    match parse_number(value) {
        Some(n) if n.is_nan() => Value::Null,
        Some(n) => {
            let clamped = n.clamp(0.0, 100.0);
            match value {
                Value::Number(orig) if clamped == n => Value::Number(orig.clone()),
                _ => number_value(clamped),
            }
        }
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn boolean_accepts_common_spellings() {
        assert_eq!(to_boolean(&json!(true)), json!(true));
        assert_eq!(to_boolean(&json!("YES")), json!(true));
        assert_eq!(to_boolean(&json!("1")), json!(true));
        assert_eq!(to_boolean(&json!(1)), json!(true));
        assert_eq!(to_boolean(&json!("off")), json!(false));
        assert_eq!(to_boolean(&json!(null)), json!(false));
    }

    #[test]
    fn number_parses_strings() {
        assert_eq!(to_number(&json!(4)), json!(4));
        assert_eq!(to_number(&json!("2.5")), json!(2.5));
        assert_eq!(to_number(&json!("nope")), Value::Null);
    }

    #[test]
    fn string_stringifies() {
        assert_eq!(to_string(&json!("a")), json!("a"));
        assert_eq!(to_string(&json!(12)), json!("12"));
        assert_eq!(to_string(&json!(false)), json!("false"));
    }

    #[test]
    fn percentage_clamps() {
        assert_eq!(to_percentage(&json!(40)), json!(40));
        assert_eq!(to_percentage(&json!("150")), json!(100.0));
        assert_eq!(to_percentage(&json!(-3)), json!(0.0));
        assert_eq!(to_percentage(&json!({})), Value::Null);
    }

    #[test]
    fn passthrough_is_identity() {
        let value = json!({"a": [1, 2]});
        assert_eq!(ValueType::passthrough().convert.apply(&value), value);
        assert_eq!(ValueType::passthrough().to_wire.apply(&value), value);
    }
}

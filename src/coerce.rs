//! Conversion of raw field text into typed attribute values.
//!
//! Built-in coercions cover numbers, dates (first matching format wins),
//! measurements (magnitude plus unit, normalized to the attribute's canonical
//! unit) and controlled vocabularies (exact match, then one qualifier toggle
//! accepted with a warning). A named conversion hook on a column replaces the
//! built-in coercion entirely.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, sync::OnceLock};

use regex::Regex;
use rust_decimal::Decimal;

use crate::{
    data::{Measure, Value, parse_naive_date, parse_naive_datetime},
    error::ConversionError,
    model::{AttributeDef, TypeRegistry, ValueType, Vocabulary, VocabularyMatch},
    rows::RowContext,
};

pub type ConversionHook = Arc<dyn Fn(&str, &RowContext<'_>) -> Result<Value, String> + Send + Sync>;

/// Everything needed to coerce text into one scalar attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarTarget {
    pub value_type: ValueType,
    pub unit: Option<String>,
    pub vocabulary: Option<(String, Vocabulary)>,
}

impl ScalarTarget {
    pub fn resolve(attr: &AttributeDef, registry: &dyn TypeRegistry) -> Option<Self> {
        let value_type = attr.kind.scalar()?;
        let vocabulary = match value_type {
            ValueType::Vocabulary => {
                let name = attr.vocabulary.as_ref()?;
                Some((name.clone(), registry.vocabulary(name)?.clone()))
            }
            _ => None,
        };
        Some(Self {
            value_type,
            unit: attr.unit.clone(),
            vocabulary,
        })
    }

    pub fn describe(&self) -> String {
        match (&self.unit, &self.vocabulary) {
            (Some(unit), _) => format!("{} ({unit})", self.value_type),
            (_, Some((name, _))) => format!("{} ({name})", self.value_type),
            _ => self.value_type.to_string(),
        }
    }
}

/// A coerced value plus the warning recorded when a fallback was needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: Value,
    pub warning: Option<String>,
}

impl Coerced {
    fn clean(value: Value) -> Self {
        Self {
            value,
            warning: None,
        }
    }
}

#[derive(Clone)]
pub struct Coercer {
    hooks: BTreeMap<String, ConversionHook>,
}

impl fmt::Debug for Coercer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coercer")
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Coercer {
    fn default() -> Self {
        let mut coercer = Self::empty();
        coercer.register("uppercase", |raw, _| Ok(Value::String(raw.to_uppercase())));
        coercer.register("lowercase", |raw, _| Ok(Value::String(raw.to_lowercase())));
        coercer.register("digits", |raw, _| {
            let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                Err("no digits present".to_string())
            } else {
                Ok(Value::String(digits))
            }
        });
        coercer
    }
}

impl Coercer {
    pub fn empty() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(&str, &RowContext<'_>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Arc::new(hook));
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn coerce(
        &self,
        raw: &str,
        target: &ScalarTarget,
        hook: Option<&str>,
        column: &str,
        row: &RowContext<'_>,
    ) -> Result<Coerced, ConversionError> {
        let raw = raw.trim();
        let failure = |reason: String| ConversionError {
            column: column.to_string(),
            value: raw.to_string(),
            target: target.describe(),
            reason,
        };
        match hook {
            Some(name) => {
                let hook = self
                    .hooks
                    .get(name)
                    .ok_or_else(|| failure(format!("conversion hook '{name}' is not registered")))?;
                hook(raw, row).map(Coerced::clean).map_err(failure)
            }
            None => convert(raw, target).map_err(failure),
        }
    }

    /// Coerces a configuration literal such as a default value.
    pub fn coerce_literal(&self, raw: &str, target: &ScalarTarget) -> Result<Value, String> {
        convert(raw.trim(), target).map(|c| c.value)
    }
}

fn convert(raw: &str, target: &ScalarTarget) -> Result<Coerced, String> {
    let value = match target.value_type {
        ValueType::String => Value::String(raw.to_string()),
        ValueType::Integer => Value::Integer(
            raw.parse()
                .map_err(|_| "not an integer".to_string())?,
        ),
        ValueType::Float => Value::Float(raw.parse().map_err(|_| "not a number".to_string())?),
        ValueType::Decimal => Value::Decimal(
            Decimal::from_str(raw).map_err(|_| "not a decimal number".to_string())?,
        ),
        ValueType::Boolean => Value::Boolean(match raw.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => true,
            "false" | "f" | "no" | "n" | "0" => false,
            _ => return Err("not a boolean".to_string()),
        }),
        ValueType::Date => {
            let date = parse_naive_date(raw).ok_or_else(|| "unrecognized date format".to_string())?;
            Value::Date(date)
        }
        ValueType::DateTime => Value::DateTime(
            parse_naive_datetime(raw).ok_or_else(|| "unrecognized timestamp format".to_string())?,
        ),
        ValueType::Measurement => Value::Measure(parse_measure(raw, target.unit.as_deref())?),
        ValueType::Vocabulary => {
            let (name, vocabulary) = target
                .vocabulary
                .as_ref()
                .ok_or_else(|| "vocabulary is not defined".to_string())?;
            return match vocabulary.resolve(raw) {
                Some(VocabularyMatch::Exact(found)) => Ok(Coerced::clean(Value::String(found))),
                Some(VocabularyMatch::Fallback(found)) => Ok(Coerced {
                    warning: Some(format!(
                        "'{raw}' is not in vocabulary '{name}'; using '{found}'"
                    )),
                    value: Value::String(found),
                }),
                None => Err(format!("not a permissible value of '{name}'")),
            };
        }
    };
    Ok(Coerced::clean(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Mass,
    Volume,
    Count,
}

struct UnitDef {
    tokens: &'static [&'static str],
    dimension: Dimension,
    exponent: i32,
}

const fn unit(tokens: &'static [&'static str], dimension: Dimension, exponent: i32) -> UnitDef {
    UnitDef {
        tokens,
        dimension,
        exponent,
    }
}

const UNITS: &[UnitDef] = &[
    unit(&["kg"], Dimension::Mass, 3),
    unit(&["g", "gm", "gram", "grams"], Dimension::Mass, 0),
    unit(&["mg"], Dimension::Mass, -3),
    unit(&["ug", "µg", "μg", "mcg"], Dimension::Mass, -6),
    unit(&["ng"], Dimension::Mass, -9),
    unit(&["l", "liter", "liters"], Dimension::Volume, 0),
    unit(&["ml"], Dimension::Volume, -3),
    unit(&["ul", "µl", "μl"], Dimension::Volume, -6),
    unit(&["cells", "cell", "count"], Dimension::Count, 0),
];

fn lookup_unit(token: &str) -> Option<&'static UnitDef> {
    let lowered = token.to_lowercase();
    UNITS.iter().find(|u| u.tokens.contains(&lowered.as_str()))
}

fn measure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([+-]?(?:\d+(?:\.\d*)?|\.\d+))\s*([A-Za-zµμ]+)?$")
            .unwrap_or_else(|err| panic!("invalid measurement pattern: {err}"))
    })
}

fn parse_measure(raw: &str, canonical: Option<&str>) -> Result<Measure, String> {
    let captures = measure_pattern()
        .captures(raw)
        .ok_or_else(|| "expected a magnitude optionally followed by a unit".to_string())?;
    let amount = Decimal::from_str(&captures[1]).map_err(|_| "magnitude out of range".to_string())?;
    let given = captures.get(2).map(|m| m.as_str());
    let Some(canonical) = canonical else {
        return Ok(Measure {
            amount,
            unit: given.unwrap_or_default().to_string(),
        });
    };
    let unit = canonical.to_string();
    let Some(given) = given.filter(|g| !g.eq_ignore_ascii_case(canonical)) else {
        return Ok(Measure { amount, unit });
    };
    let (from, to) = match (lookup_unit(given), lookup_unit(canonical)) {
        (Some(from), Some(to)) if from.dimension == to.dimension => (from, to),
        (Some(_), Some(_)) => {
            return Err(format!("unit '{given}' is not convertible to '{canonical}'"));
        }
        _ => return Err(format!("unknown unit '{given}'")),
    };
    let shift = from.exponent - to.exponent;
    let factor = if shift >= 0 {
        Decimal::from(10i64.pow(shift.unsigned_abs()))
    } else {
        Decimal::new(1, shift.unsigned_abs())
    };
    let amount = amount
        .checked_mul(factor)
        .ok_or_else(|| "magnitude out of range".to_string())?
        .normalize();
    Ok(Measure { amount, unit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Row;

    fn target(value_type: ValueType) -> ScalarTarget {
        ScalarTarget {
            value_type,
            unit: None,
            vocabulary: None,
        }
    }

    fn coerce(raw: &str, target: &ScalarTarget) -> Result<Coerced, ConversionError> {
        let headers = vec!["col".to_string()];
        let row = Row::new(1, vec![raw.to_string()]);
        let ctx = RowContext::new(&row, &headers);
        Coercer::default().coerce(raw, target, None, "col", &ctx)
    }

    #[test]
    fn numbers_and_booleans() {
        assert_eq!(coerce("42", &target(ValueType::Integer)).unwrap().value, Value::Integer(42));
        assert_eq!(coerce(" 3.5 ", &target(ValueType::Float)).unwrap().value, Value::Float(3.5));
        assert_eq!(coerce("Y", &target(ValueType::Boolean)).unwrap().value, Value::Boolean(true));
        let err = coerce("abc", &target(ValueType::Integer)).unwrap_err();
        assert_eq!(err.column, "col");
        assert_eq!(err.value, "abc");
    }

    #[test]
    fn measurements_normalize_to_canonical_unit() {
        let grams = ScalarTarget {
            unit: Some("g".into()),
            ..target(ValueType::Measurement)
        };
        let parsed = coerce("3.4", &grams).unwrap().value;
        assert_eq!(parsed.as_display(), "3.4 g");
        let parsed = coerce("250 mg", &grams).unwrap().value;
        assert_eq!(parsed.as_display(), "0.25 g");
        let parsed = coerce("2kg", &grams).unwrap().value;
        assert_eq!(parsed.as_display(), "2000 g");
        assert!(coerce("3 ml", &grams).unwrap_err().reason.contains("not convertible"));
        assert!(coerce("abc", &grams).is_err());
    }

    #[test]
    fn vocabulary_fallback_carries_warning() {
        let vocab = ScalarTarget {
            vocabulary: Some((
                "type".into(),
                Vocabulary {
                    values: vec!["Fixed Tissue".into()],
                    qualifiers: vec![" Tissue".into()],
                },
            )),
            ..target(ValueType::Vocabulary)
        };
        let exact = coerce("Fixed Tissue", &vocab).unwrap();
        assert!(exact.warning.is_none());
        let fallback = coerce("Fixed", &vocab).unwrap();
        assert_eq!(fallback.value, Value::from("Fixed Tissue"));
        assert!(fallback.warning.unwrap().contains("using 'Fixed Tissue'"));
        assert!(coerce("Frozen", &vocab).is_err());
    }

    #[test]
    fn hook_overrides_builtin_coercion() {
        let mut coercer = Coercer::default();
        coercer.register("spn", |raw, row| {
            Ok(Value::String(format!("{}-{}", raw, row.row.number)))
        });
        let headers = vec!["spn".to_string()];
        let row = Row::new(7, vec!["S1".into()]);
        let ctx = RowContext::new(&row, &headers);
        let coerced = coercer
            .coerce("S1", &target(ValueType::Integer), Some("spn"), "spn", &ctx)
            .unwrap();
        assert_eq!(coerced.value, Value::from("S1-7"));

        let digits = coercer
            .coerce("S-4001", &target(ValueType::String), Some("digits"), "spn", &ctx)
            .unwrap();
        assert_eq!(digits.value, Value::from("4001"));
    }
}

//! Declarative WHERE-clause building.
//!
//! A [`Conditions`] list renders to `col1 <op> AND col2 <op> ...`. Operator templates use
//! the `%1$s` placeholder for the rendered operand, so `IN(%1$s)`, `!= %1$s` or
//! `LIKE %1$s` all work the same way.

use std::fmt;

use rusqlite::types::Value;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value as JsonValue;

pub const PLACEHOLDER: &str = "%1$s";
const EQUALS: &str = "= %1$s";

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = 'value'`; `NULL` renders as `IS NULL`.
    Equals(Value),
    /// A single operand substituted into `template`.
    Compare {
        template: String,
        value: Value,
        quote: bool,
    },
    /// Comma-joined operands substituted into `template`, e.g. `IN(%1$s)`.
    In {
        template: String,
        values: Vec<Value>,
        quote: bool,
    },
}

impl Condition {
    pub fn equals(value: impl Into<Value>) -> Self {
        Condition::Equals(value.into())
    }

    /// `column = <sql>` with `sql` inserted verbatim.
    pub fn raw(sql: impl Into<String>) -> Self {
        Condition::Compare {
            template: EQUALS.into(),
            value: Value::Text(sql.into()),
            quote: false,
        }
    }

    pub fn op(template: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Compare {
            template: template.into(),
            value: value.into(),
            quote: true,
        }
    }

    pub fn is_in<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::In {
            template: "IN(%1$s)".into(),
            values: values.into_iter().map(Into::into).collect(),
            quote: true,
        }
    }

    pub fn not_in<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::In {
            template: "NOT IN(%1$s)".into(),
            values: values.into_iter().map(Into::into).collect(),
            quote: true,
        }
    }

    /// Leave operands unquoted (numbers, pre-quoted strings, column references).
    pub fn unquoted(self) -> Self {
        match self {
            Condition::Equals(value) => Condition::Compare {
                template: EQUALS.into(),
                value,
                quote: false,
            },
            Condition::Compare {
                template, value, ..
            } => Condition::Compare {
                template,
                value,
                quote: false,
            },
            Condition::In {
                template, values, ..
            } => Condition::In {
                template,
                values,
                quote: false,
            },
        }
    }

    pub fn render(&self, column: &str) -> String {
        match self {
            Condition::Equals(Value::Null) => format!("{column} IS NULL"),
            Condition::Equals(value) => {
                format!("{column} {}", apply(EQUALS, &quote_literal(value)))
            }
            Condition::Compare {
                template,
                value,
                quote,
            } => {
                let operand = if *quote {
                    quote_literal(value)
                } else {
                    raw_literal(value)
                };
                format!("{column} {}", apply(template, &operand))
            }
            Condition::In {
                template,
                values,
                quote,
            } => {
                let operand = values
                    .iter()
                    .map(|v| if *quote { quote_literal(v) } else { raw_literal(v) })
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{column} {}", apply(template, &operand))
            }
        }
    }
}

fn apply(template: &str, operand: &str) -> String {
    template.trim().replace(PLACEHOLDER, operand)
}

/// SQL literal for `value`, with text escaped by doubling single quotes.
pub fn quote_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

fn raw_literal(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => quote_literal(other),
    }
}

/// Ordered `column -> condition` list rendered as an `AND` group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions(Vec<(String, Condition)>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.push(column, condition);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, condition: Condition) {
        self.0.push((column.into(), condition));
    }

    /// Equality group over every column of `row`.
    pub fn matching<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(column, value)| (column.to_string(), Condition::Equals(value.clone())))
                .collect(),
        )
    }

    /// Same conditions with every column prefixed by `alias.`.
    pub fn qualified(&self, alias: &str) -> Self {
        Self(
            self.0
                .iter()
                .map(|(column, condition)| (format!("{alias}.{column}"), condition.clone()))
                .collect(),
        )
    }

    pub fn extend(&mut self, other: &Conditions) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Condition)> {
        self.0.iter()
    }

    pub fn to_sql(&self) -> String {
        self.0
            .iter()
            .map(|(column, condition)| condition.render(column))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl fmt::Display for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl<K: Into<String>> FromIterator<(K, Condition)> for Conditions {
    fn from_iter<I: IntoIterator<Item = (K, Condition)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, c)| (k.into(), c)).collect())
    }
}

/// Most groups OR-joined into one predicate. SQLite caps expression depth at 1000
/// and every `OR` adds a level.
pub const MAX_OR_GROUPS: usize = 250;

/// `(group1) OR (group2) ...` predicates matching any of the given exact tuples, split
/// into chunks of at most [`MAX_OR_GROUPS`] groups. Callers run one statement per chunk.
pub fn any_of(groups: &[Conditions]) -> Vec<String> {
    let groups: Vec<&Conditions> = groups.iter().filter(|group| !group.is_empty()).collect();
    groups
        .chunks(MAX_OR_GROUPS)
        .map(|chunk| {
            chunk
                .iter()
                .map(|group| format!("({})", group.to_sql()))
                .collect::<Vec<_>>()
                .join(" OR ")
        })
        .collect()
}

/// Joins non-empty predicates with `AND`.
pub fn all_of<'a, I>(predicates: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    predicates
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub(crate) fn json_to_value(json: &JsonValue) -> Result<Value, String> {
    match json {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Real(f))
            } else {
                Err(format!("unsupported number {n}"))
            }
        }
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        other => Err(format!("expected a scalar value, got {other}")),
    }
}

impl TryFrom<JsonValue> for Condition {
    type Error = String;

    /// Unwraps the nested `{value, operator?, no_quote?}` shape. Settings found on
    /// inner levels override outer ones.
    fn try_from(json: JsonValue) -> Result<Self, Self::Error> {
        let mut template: Option<String> = None;
        let mut quote = true;
        let mut current = json;
        loop {
            match current {
                JsonValue::Object(mut map) => {
                    if let Some(op) = map.get("operator") {
                        template = Some(
                            op.as_str()
                                .ok_or_else(|| "operator must be a string".to_string())?
                                .to_string(),
                        );
                    }
                    if let Some(nq) = map.get("no_quote") {
                        quote = !nq.as_bool().unwrap_or(false);
                    }
                    current = map
                        .remove("value")
                        .ok_or_else(|| "condition object requires a `value`".to_string())?;
                }
                JsonValue::Array(items) => {
                    let values = items
                        .iter()
                        .map(json_to_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Condition::In {
                        template: template.unwrap_or_else(|| "IN(%1$s)".into()),
                        values,
                        quote,
                    });
                }
                scalar => {
                    let value = json_to_value(&scalar)?;
                    return Ok(match (template, quote) {
                        (None, true) => Condition::Equals(value),
                        (template, quote) => Condition::Compare {
                            template: template.unwrap_or_else(|| EQUALS.into()),
                            value,
                            quote,
                        },
                    });
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Condition::try_from(json).map_err(de::Error::custom)
    }
}

/// Keeps JSON object entries in document order.
pub(crate) struct Ordered<T>(pub Vec<(String, T)>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(std::marker::PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(std::marker::PhantomData))
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Ordered(entries) = Ordered::<Condition>::deserialize(deserializer)?;
        Ok(Conditions(entries))
    }
}

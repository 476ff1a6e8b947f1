use serde_json::{Map, Value};

/// Field carrying the event timestamp, used by time-range filters.
pub(crate) const DATETIME_FIELD: &str = "datetime";

/// `time_start` / `time_end` bounds of a query filter.
pub(crate) fn time_range(filter: &Map<String, Value>) -> (Option<&str>, Option<&str>) {
    (
        filter.get("time_start").and_then(Value::as_str),
        filter.get("time_end").and_then(Value::as_str),
    )
}

/// Clause of the small query-string subset evaluated in process.
#[derive(Debug, PartialEq)]
enum Clause {
    All,
    Exists(String),
    FieldEquals(String, String),
    MessageContains(String),
}

/// In-process evaluator for query strings.
///
/// Understands `*`, `_exists_:field`, `field:value` (`field:*` meaning
/// exists) and bare terms matched case-insensitively against `message`.
/// Clauses joined by ` AND ` must all hold.
#[derive(Debug)]
pub(crate) struct QueryMatcher {
    clauses: Vec<Clause>,
}

impl QueryMatcher {
    pub(crate) fn parse(query: &str) -> Self {
        let clauses = query
            .split(" AND ")
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(parse_clause)
            .collect();
        Self { clauses }
    }

    pub(crate) fn matches(&self, source: &Map<String, Value>) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::All => true,
            Clause::Exists(field) => source.get(field).is_some_and(|v| !v.is_null()),
            Clause::FieldEquals(field, expected) => source
                .get(field)
                .is_some_and(|v| value_matches(v, |s| s == expected.as_str())),
            Clause::MessageContains(needle) => source
                .get("message")
                .is_some_and(|v| value_matches(v, |s| s.to_lowercase().contains(needle))),
        })
    }
}

fn parse_clause(term: &str) -> Clause {
    if term == "*" {
        return Clause::All;
    }
    match term.split_once(':') {
        Some(("_exists_", field)) => Clause::Exists(field.to_string()),
        Some((field, "*")) => Clause::Exists(field.to_string()),
        Some((field, value)) if !field.is_empty() => {
            Clause::FieldEquals(field.to_string(), value.trim_matches('"').to_string())
        }
        _ => Clause::MessageContains(term.trim_matches('"').to_lowercase()),
    }
}

fn value_matches(value: &Value, predicate: impl Fn(&str) -> bool + Copy) -> bool {
    match value {
        Value::String(s) => predicate(s.as_str()),
        Value::Number(n) => predicate(&n.to_string()),
        Value::Bool(b) => predicate(if *b { "true" } else { "false" }),
        Value::Array(items) => items.iter().any(|item| value_matches(item, predicate)),
        _ => false,
    }
}

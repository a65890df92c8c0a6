use std::collections::HashMap;

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::ApiError;

/// Reserved control keys, never treated as filter fields.
const RESERVED: [&str; 4] = ["sort", "fields", "limit", "page"];

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_LIMIT: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Gte,
    Gt,
    Lte,
    Lt,
}

impl Op {
    fn sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Gte => ">=",
            Op::Gt => ">",
            Op::Lte => "<=",
            Op::Lt => "<",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "gte" => Some(Op::Gte),
            "gt" => Some(Op::Gt),
            "lte" => Some(Op::Lte),
            "lt" => Some(Op::Lt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Bool,
    Text,
    Timestamp,
    /// A Postgres enum column. Compared through a `::text` cast so a bound
    /// TEXT parameter matches the label.
    Enum,
}

/// A filterable/sortable column with its value type, so query-string values
/// are typed before they ever reach the database.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Int,
        }
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Bool,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
        }
    }

    pub const fn timestamp(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Timestamp,
        }
    }

    pub const fn enumerated(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Enum,
        }
    }

    fn lhs(&self) -> String {
        match self.kind {
            ColumnKind::Enum => format!("\"{}\"::text", self.name),
            _ => format!("\"{}\"", self.name),
        }
    }
}

/// A query-string value parsed against its column's type. A value that does
/// not fit the column is a cast error, reported before any SQL is built.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(i64),
    Bool(bool),
    Text(String),
    Timestamp(OffsetDateTime),
}

impl BindValue {
    fn parse(column: &Column, raw: &str) -> Result<Self, ApiError> {
        match column.kind {
            ColumnKind::Int => raw
                .parse::<i64>()
                .map(BindValue::Int)
                .map_err(|_| ApiError::cast(column.name, raw)),
            ColumnKind::Bool => match raw {
                "true" => Ok(BindValue::Bool(true)),
                "false" => Ok(BindValue::Bool(false)),
                _ => Err(ApiError::cast(column.name, raw)),
            },
            ColumnKind::Timestamp => OffsetDateTime::parse(raw, &Rfc3339)
                .map(BindValue::Timestamp)
                .map_err(|_| ApiError::cast(column.name, raw)),
            ColumnKind::Text | ColumnKind::Enum => Ok(BindValue::Text(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Compare {
        column: Column,
        op: Op,
        value: BindValue,
    },
    /// A field outside the resource's column whitelist. Matches nothing
    /// instead of erroring, mirroring a document store queried on a field
    /// no record has.
    Unsatisfiable,
}

#[derive(Debug, Clone, PartialEq)]
struct SortKey {
    field: String,
    descending: bool,
}

/// Translates untrusted query parameters into filter, sort, projection and
/// pagination clauses for a resource with a known column set. Identifiers
/// are only ever taken from the whitelist; values always go through binds.
#[derive(Debug, Clone)]
pub struct QueryFeatures {
    conditions: Vec<Condition>,
    sort: Vec<SortKey>,
    fields: Option<Vec<String>>,
    page: i64,
    limit: i64,
}

impl QueryFeatures {
    pub fn from_params(
        params: &HashMap<String, String>,
        columns: &[Column],
    ) -> Result<Self, ApiError> {
        let mut conditions: Vec<(String, Condition)> = Vec::new();
        for (key, value) in params {
            if RESERVED.contains(&key.as_str()) {
                continue;
            }
            let (field, op) = split_operator(key);
            let cond = match (columns.iter().find(|c| c.name == field), op) {
                (Some(column), Some(op)) => Condition::Compare {
                    column: *column,
                    op,
                    value: BindValue::parse(column, value)?,
                },
                _ => Condition::Unsatisfiable,
            };
            conditions.push((key.clone(), cond));
        }
        // Parameter maps carry no order; keep generated SQL stable.
        conditions.sort_by(|a, b| a.0.cmp(&b.0));

        let sort = match params.get("sort") {
            Some(raw) => {
                let keys: Vec<SortKey> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .filter_map(|k| {
                        let (field, descending) = match k.strip_prefix('-') {
                            Some(rest) => (rest, true),
                            None => (k, false),
                        };
                        columns.iter().any(|c| c.name == field).then(|| SortKey {
                            field: field.to_string(),
                            descending,
                        })
                    })
                    .collect();
                if keys.is_empty() {
                    default_sort()
                } else {
                    keys
                }
            }
            None => default_sort(),
        };

        let fields = params.get("fields").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        });

        Ok(Self {
            conditions: conditions.into_iter().map(|(_, c)| c).collect(),
            sort,
            fields,
            page: positive_or(params.get("page"), DEFAULT_PAGE),
            limit: positive_or(params.get("limit"), DEFAULT_LIMIT),
        })
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    /// True when the caller filtered on the given column explicitly. Lets a
    /// repository drop a default scope the filter is meant to override.
    pub fn has_filter(&self, field: &str) -> bool {
        self.conditions.iter().any(|cond| {
            matches!(cond, Condition::Compare { column, .. } if column.name == field)
        })
    }

    /// Appends ` AND <cond>` for every filter condition. The caller's base
    /// query must already carry a WHERE clause.
    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        for cond in &self.conditions {
            qb.push(" AND ");
            match cond {
                Condition::Unsatisfiable => {
                    qb.push("FALSE");
                }
                Condition::Compare { column, op, value } => {
                    qb.push(format!("{} {} ", column.lhs(), op.sql()));
                    match value {
                        BindValue::Int(n) => qb.push_bind(*n),
                        BindValue::Bool(b) => qb.push_bind(*b),
                        BindValue::Text(s) => qb.push_bind(s.clone()),
                        BindValue::Timestamp(t) => qb.push_bind(*t),
                    };
                }
            }
        }
    }

    pub fn push_order_by(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" ORDER BY ");
        let clause = self
            .sort
            .iter()
            .map(|key| {
                format!(
                    "\"{}\" {}",
                    key.field,
                    if key.descending { "DESC" } else { "ASC" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(clause);
    }

    pub fn push_pagination(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" LIMIT ");
        qb.push_bind(self.limit);
        qb.push(" OFFSET ");
        qb.push_bind(self.offset());
    }

    /// Field projection, applied to the serialized record. `FromRow` needs
    /// every column, so narrowing happens on the response object instead of
    /// in the SELECT list.
    pub fn project(&self, mut record: Value) -> Value {
        let Some(fields) = &self.fields else {
            return record;
        };
        if let Value::Object(map) = &mut record {
            map.retain(|key, _| fields.iter().any(|f| f == key));
        }
        record
    }
}

fn default_sort() -> Vec<SortKey> {
    vec![SortKey {
        field: "created_at".to_string(),
        descending: false,
    }]
}

/// `priority[gte]` -> `("priority", Some(Gte))`; a bare key is equality.
/// An unrecognized suffix leaves the whole key as an (unknown) field name.
fn split_operator(key: &str) -> (&str, Option<Op>) {
    if let Some((field, rest)) = key.split_once('[') {
        if let Some(suffix) = rest.strip_suffix(']') {
            if let Some(op) = Op::from_suffix(suffix) {
                return (field, Some(op));
            }
        }
        return (key, None);
    }
    (key, Some(Op::Eq))
}

fn positive_or(raw: Option<&String>, default: i64) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: [Column; 5] = [
        Column::text("title"),
        Column::text("description"),
        Column::int("priority"),
        Column::boolean("completed"),
        Column::timestamp("created_at"),
    ];

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn features(pairs: &[(&str, &str)]) -> QueryFeatures {
        QueryFeatures::from_params(&params(pairs), &COLUMNS).expect("params should parse")
    }

    fn rendered_sql(features: &QueryFeatures) -> String {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT * FROM todos WHERE owner = ");
        qb.push_bind(uuid::Uuid::nil());
        features.push_conditions(&mut qb);
        features.push_order_by(&mut qb);
        features.push_pagination(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn defaults_when_params_empty() {
        let f = features(&[]);
        assert_eq!(f.page(), 1);
        assert_eq!(f.limit(), 10);
        assert_eq!(f.offset(), 0);
        let sql = rendered_sql(&f);
        assert!(sql.contains("ORDER BY \"created_at\" ASC"));
        assert!(sql.ends_with("LIMIT $2 OFFSET $3"));
    }

    #[test]
    fn comparison_suffixes_translate_to_operators() {
        let f = features(&[("priority[gte]", "2")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND \"priority\" >= $2"));
    }

    #[test]
    fn bare_keys_are_equality_filters() {
        let f = features(&[("completed", "true")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND \"completed\" = $2"));
    }

    #[test]
    fn unknown_fields_match_nothing() {
        let f = features(&[("bogus", "1")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND FALSE"));
        assert!(!sql.contains("bogus"));
    }

    #[test]
    fn unknown_operator_suffix_matches_nothing() {
        let f = features(&[("priority[within]", "2")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND FALSE"));
    }

    #[test]
    fn mistyped_int_value_is_a_cast_error() {
        let err = QueryFeatures::from_params(&params(&[("priority[gte]", "abc")]), &COLUMNS)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for priority: abc");
    }

    #[test]
    fn mistyped_bool_value_is_a_cast_error() {
        let err =
            QueryFeatures::from_params(&params(&[("completed", "maybe")]), &COLUMNS).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for completed: maybe");
    }

    #[test]
    fn mistyped_timestamp_value_is_a_cast_error() {
        let err = QueryFeatures::from_params(&params(&[("created_at[gt]", "yesterday")]), &COLUMNS)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for created_at: yesterday");
    }

    #[test]
    fn timestamp_values_parse_as_rfc3339() {
        let f = features(&[("created_at[gte]", "2026-01-01T00:00:00Z")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND \"created_at\" >= $2"));
    }

    #[test]
    fn enum_columns_compare_through_a_text_cast() {
        let columns = [Column::enumerated("role")];
        let f = QueryFeatures::from_params(&params(&[("role", "admin")]), &columns)
            .expect("params should parse");
        let sql = rendered_sql(&f);
        assert!(sql.contains("AND \"role\"::text = $2"));
    }

    #[test]
    fn has_filter_reports_explicit_conditions_only() {
        let f = features(&[("completed", "true")]);
        assert!(f.has_filter("completed"));
        assert!(!f.has_filter("priority"));

        let f = features(&[("bogus", "1")]);
        assert!(!f.has_filter("bogus"));
    }

    #[test]
    fn sort_keys_respect_direction_and_order() {
        let f = features(&[("sort", "-priority,created_at")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("ORDER BY \"priority\" DESC, \"created_at\" ASC"));
    }

    #[test]
    fn sort_keys_outside_whitelist_are_skipped() {
        let f = features(&[("sort", "-secrets,priority")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("ORDER BY \"priority\" ASC"));
        assert!(!sql.contains("secrets"));
    }

    #[test]
    fn sort_with_only_unknown_keys_falls_back_to_default() {
        let f = features(&[("sort", "secrets")]);
        let sql = rendered_sql(&f);
        assert!(sql.contains("ORDER BY \"created_at\" ASC"));
    }

    #[test]
    fn pagination_computes_offset() {
        let f = features(&[("page", "3"), ("limit", "5")]);
        assert_eq!(f.limit(), 5);
        assert_eq!(f.offset(), 10);
    }

    #[test]
    fn non_numeric_or_non_positive_paging_uses_defaults() {
        let f = features(&[("page", "abc"), ("limit", "0")]);
        assert_eq!(f.page(), 1);
        assert_eq!(f.limit(), 10);

        let f = features(&[("page", "-2")]);
        assert_eq!(f.page(), 1);
    }

    #[test]
    fn projection_retains_requested_keys_only() {
        let f = features(&[("fields", "title,priority")]);
        let projected = f.project(serde_json::json!({
            "id": "x", "title": "Buy milk", "priority": 2, "completed": false
        }));
        let obj = projected.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("title"));
        assert!(obj.contains_key("priority"));
    }

    #[test]
    fn no_projection_returns_record_unchanged() {
        let f = features(&[]);
        let record = serde_json::json!({ "id": "x", "title": "Buy milk" });
        assert_eq!(f.project(record.clone()), record);
    }

    #[test]
    fn reserved_keys_never_become_filters() {
        let f = features(&[
            ("sort", "priority"),
            ("limit", "5"),
            ("page", "2"),
            ("fields", "title"),
        ]);
        let sql = rendered_sql(&f);
        assert!(!sql.contains("AND "));
    }
}

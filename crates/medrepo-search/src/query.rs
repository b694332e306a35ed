//! Search queries over indexed parameters.
//!
//! A query is a resource type plus a conjunction of parameter filters; each
//! filter is a disjunction of typed predicates (`code=a,b` matches either).
//! The same structure is evaluated in memory against index rows (memory
//! engine, subscription criteria) and translated to SQL by the Postgres
//! engine.

use time::OffsetDateTime;

use crate::catalog;
use crate::error::SearchError;
use crate::extract::{normalize_string, parse_date_to_range, parse_reference};
use crate::types::{IndexValue, SearchIndexRow, ValueKind};

/// Comparison prefix for ordered values (dates, numbers, quantities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Prefix {
    /// Splits a two-letter prefix off a value, defaulting to `eq`.
    fn split(raw: &str) -> (Prefix, &str) {
        let prefix = match raw.get(..2) {
            Some("eq") => Prefix::Eq,
            Some("ne") => Prefix::Ne,
            Some("lt") => Prefix::Lt,
            Some("le") => Prefix::Le,
            Some("gt") => Prefix::Gt,
            Some("ge") => Prefix::Ge,
            _ => return (Prefix::Eq, raw),
        };
        (prefix, &raw[2..])
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Prefix::Eq => "eq",
            Prefix::Ne => "ne",
            Prefix::Lt => "lt",
            Prefix::Le => "le",
            Prefix::Gt => "gt",
            Prefix::Ge => "ge",
        }
    }

    fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Prefix::Eq => lhs == rhs,
            Prefix::Ne => lhs != rhs,
            Prefix::Lt => lhs < rhs,
            Prefix::Le => lhs <= rhs,
            Prefix::Gt => lhs > rhs,
            Prefix::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMatch {
    /// Case-insensitive prefix (default)
    Prefix,
    Exact,
    Contains,
}

/// System constraint of a token filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSystem {
    /// `code`: any system
    Any,
    /// `|code`: the value must have no system
    Absent,
    /// `system|code` or `system|`
    Is(String),
}

/// A single typed comparison against an index value.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    String {
        mode: StringMatch,
        value: String,
    },
    Token {
        system: TokenSystem,
        /// `None` for `system|` (any code in the system)
        code: Option<String>,
    },
    Date {
        prefix: Prefix,
        start: OffsetDateTime,
        end: OffsetDateTime,
    },
    Number {
        prefix: Prefix,
        value: f64,
    },
    Reference {
        target_type: Option<String>,
        target_id: String,
    },
    Quantity {
        prefix: Prefix,
        value: f64,
        system: Option<String>,
        unit: Option<String>,
    },
}

impl Predicate {
    /// Evaluates this predicate against one index value.
    pub fn matches(&self, value: &IndexValue) -> bool {
        match (self, value) {
            (Predicate::String { mode, value: q }, IndexValue::String { normalized, exact }) => {
                match mode {
                    StringMatch::Prefix => normalized.starts_with(&normalize_string(q)),
                    StringMatch::Contains => normalized.contains(&normalize_string(q)),
                    StringMatch::Exact => exact == q,
                }
            }
            (Predicate::Token { system, code }, IndexValue::Token { system: sys, code: c }) => {
                let system_ok = match system {
                    TokenSystem::Any => true,
                    TokenSystem::Absent => sys.is_none(),
                    TokenSystem::Is(s) => sys.as_deref() == Some(s.as_str()),
                };
                system_ok && code.as_ref().is_none_or(|q| q == c)
            }
            (
                Predicate::Date { prefix, start, end },
                IndexValue::Date { start: vs, end: ve },
            ) => match prefix {
                Prefix::Eq => vs >= start && ve <= end,
                Prefix::Ne => !(vs >= start && ve <= end),
                Prefix::Lt => vs < start,
                Prefix::Le => vs <= end,
                Prefix::Gt => ve > end,
                Prefix::Ge => ve >= start,
            },
            (Predicate::Number { prefix, value: q }, IndexValue::Number { value }) => {
                prefix.compare(*value, *q)
            }
            (
                Predicate::Quantity { prefix, value: q, system, unit },
                IndexValue::Quantity { value, system: vs, unit: vu },
            ) => {
                prefix.compare(*value, *q)
                    && system.as_ref().is_none_or(|s| vs.as_deref() == Some(s.as_str()))
                    && unit.as_ref().is_none_or(|u| vu.as_deref() == Some(u.as_str()))
            }
            (
                Predicate::Reference { target_type, target_id },
                IndexValue::Reference { target_type: vt, target_id: vid },
            ) => {
                target_id == vid
                    && target_type
                        .as_ref()
                        .is_none_or(|t| vt.as_deref() == Some(t.as_str()))
            }
            _ => false,
        }
    }
}

/// Filter on one parameter: matches when any predicate matches any row of
/// that parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamFilter {
    pub param: String,
    pub kind: ValueKind,
    pub predicates: Vec<Predicate>,
}

impl ParamFilter {
    pub fn matches(&self, rows: &[SearchIndexRow]) -> bool {
        rows.iter()
            .filter(|row| row.param == self.param)
            .any(|row| self.predicates.iter().any(|p| p.matches(&row.value)))
    }
}

/// A parsed search query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchQuery {
    pub resource_type: String,
    /// `_id` constraint (any of)
    pub ids: Option<Vec<String>>,
    pub filters: Vec<ParamFilter>,
    /// `_count` limit
    pub count: Option<usize>,
}

impl SearchQuery {
    /// Query matching every lineage of a type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    /// Parses `Type` or `Type?param=value&...` (subscription criteria form).
    pub fn parse(criteria: &str) -> Result<Self, SearchError> {
        let (resource_type, query) = match criteria.split_once('?') {
            Some((t, q)) => (t, q),
            None => (criteria, ""),
        };
        let resource_type = resource_type.trim().trim_start_matches('/');
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()));
        Self::from_pairs(resource_type, pairs)
    }

    /// Builds a query from already-decoded `(name, value)` pairs.
    pub fn from_pairs(
        resource_type: &str,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, SearchError> {
        if resource_type.is_empty() || medrepo_core::lookup_type(resource_type).is_none() {
            return Err(SearchError::UnknownResourceType(resource_type.to_string()));
        }

        let mut query = SearchQuery::new(resource_type);
        for (name, raw) in pairs {
            let (param, modifier) = match name.split_once(':') {
                Some((p, m)) => (p.to_string(), Some(m.to_string())),
                None => (name.clone(), None),
            };

            match param.as_str() {
                "_id" => {
                    let ids = raw.split(',').map(str::to_string).collect::<Vec<_>>();
                    query.ids = Some(match query.ids.take() {
                        // repeated _id narrows to the intersection
                        Some(existing) => existing.into_iter().filter(|id| ids.contains(id)).collect(),
                        None => ids,
                    });
                    continue;
                }
                "_count" => {
                    let count = raw
                        .parse::<usize>()
                        .map_err(|_| SearchError::invalid_value(&param, &raw))?;
                    query.count = Some(count);
                    continue;
                }
                _ => {}
            }

            let kind = catalog::param_kind(resource_type, &param).ok_or_else(|| {
                SearchError::UnknownParameter {
                    resource_type: resource_type.to_string(),
                    param: param.clone(),
                }
            })?;

            let predicates = split_values(&raw)
                .map(|v| parse_predicate(&param, kind, modifier.as_deref(), v))
                .collect::<Result<Vec<_>, _>>()?;
            if predicates.is_empty() {
                return Err(SearchError::invalid_value(&param, &raw));
            }

            query.filters.push(ParamFilter {
                param,
                kind,
                predicates,
            });
        }
        Ok(query)
    }

    pub fn with_filter(mut self, filter: ParamFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Evaluates the query against the index rows of one lineage.
    pub fn matches(&self, resource_id: &str, rows: &[SearchIndexRow]) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| id == resource_id)
        {
            return false;
        }
        self.filters.iter().all(|f| f.matches(rows))
    }
}

/// Splits on unescaped commas (`\,` is a literal comma).
fn split_values(raw: &str) -> impl Iterator<Item = String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts.into_iter().filter(|s| !s.is_empty())
}

fn parse_predicate(
    param: &str,
    kind: ValueKind,
    modifier: Option<&str>,
    raw: String,
) -> Result<Predicate, SearchError> {
    let unsupported = |m: &str| SearchError::UnsupportedModifier {
        param: param.to_string(),
        modifier: m.to_string(),
    };

    match kind {
        ValueKind::String => {
            let mode = match modifier {
                None => StringMatch::Prefix,
                Some("exact") => StringMatch::Exact,
                Some("contains") => StringMatch::Contains,
                Some(m) => return Err(unsupported(m)),
            };
            Ok(Predicate::String { mode, value: raw })
        }
        ValueKind::Token => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (system, code) = match raw.split_once('|') {
                None => (TokenSystem::Any, Some(raw.clone())),
                Some(("", code)) => (TokenSystem::Absent, Some(code.to_string())),
                Some((system, "")) => (TokenSystem::Is(system.to_string()), None),
                Some((system, code)) => (TokenSystem::Is(system.to_string()), Some(code.to_string())),
            };
            Ok(Predicate::Token { system, code })
        }
        ValueKind::Date => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = Prefix::split(&raw);
            let (start, end) =
                parse_date_to_range(rest).ok_or_else(|| SearchError::invalid_value(param, &raw))?;
            Ok(Predicate::Date { prefix, start, end })
        }
        ValueKind::Number => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = Prefix::split(&raw);
            let value = rest
                .parse::<f64>()
                .map_err(|_| SearchError::invalid_value(param, &raw))?;
            Ok(Predicate::Number { prefix, value })
        }
        ValueKind::Quantity => {
            if let Some(m) = modifier {
                return Err(unsupported(m));
            }
            let (prefix, rest) = Prefix::split(&raw);
            let mut parts = rest.splitn(3, '|');
            let value = parts
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| SearchError::invalid_value(param, &raw))?;
            let system = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
            let unit = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
            Ok(Predicate::Quantity {
                prefix,
                value,
                system,
                unit,
            })
        }
        ValueKind::Reference => {
            // `subject:Patient=123` restricts the target type
            let type_modifier = match modifier {
                None => None,
                Some(m) if m.chars().next().is_some_and(|c| c.is_ascii_uppercase()) => {
                    Some(m.to_string())
                }
                Some(m) => return Err(unsupported(m)),
            };
            let (parsed_type, target_id) =
                parse_reference(&raw).ok_or_else(|| SearchError::invalid_value(param, &raw))?;
            Ok(Predicate::Reference {
                target_type: type_modifier.or(parsed_type),
                target_id,
            })
        }
    }
}

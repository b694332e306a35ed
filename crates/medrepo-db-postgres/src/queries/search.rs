//! Search query translation.
//!
//! Each parameter filter becomes an `EXISTS` over `search_index` whose
//! predicates are an `OR` of JSONB comparisons on the stored index value;
//! filters are `AND`ed. Results are current, non-deleted versions ordered by
//! id.

use medrepo_search::extract::normalize_string;
use medrepo_search::{ParamFilter, Predicate, Prefix, SearchQuery, StringMatch, TokenSystem};
use medrepo_storage::StoredResource;
use sqlx_core::executor::Executor;
use sqlx_core::query_builder::QueryBuilder;
use sqlx_postgres::Postgres;

use super::{VersionRow, into_stored, time_to_chrono};
use crate::error::Result;

/// Runs a search against the shard the executor is bound to.
pub async fn search<'e, E>(executor: E, query: &SearchQuery) -> Result<Vec<StoredResource>>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut builder = build_search(query);
    let rows: Vec<VersionRow> = builder.build_query_as().fetch_all(executor).await?;
    rows.into_iter().map(into_stored).collect()
}

pub(crate) fn build_search(query: &SearchQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        "SELECT v.resource_type, v.id, v.version_id, v.last_updated, v.deleted, v.content \
         FROM resource_current c \
         JOIN resource_version v \
           ON v.resource_type = c.resource_type AND v.id = c.id AND v.version_id = c.version_id \
         WHERE NOT c.deleted AND c.resource_type = ",
    );
    builder.push_bind(query.resource_type.clone());

    if let Some(ids) = &query.ids {
        builder.push(" AND c.id = ANY(");
        builder.push_bind(ids.clone());
        builder.push(")");
    }

    for filter in &query.filters {
        push_filter(&mut builder, filter);
    }

    builder.push(" ORDER BY c.id COLLATE \"C\"");
    if let Some(count) = query.count {
        builder.push(" LIMIT ");
        builder.push_bind(i64::try_from(count).unwrap_or(i64::MAX));
    }
    builder
}

fn push_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &ParamFilter) {
    builder.push(
        " AND EXISTS (SELECT 1 FROM search_index s \
         WHERE s.resource_type = c.resource_type AND s.resource_id = c.id AND s.param = ",
    );
    builder.push_bind(filter.param.clone());
    builder.push(" AND (");
    for (idx, predicate) in filter.predicates.iter().enumerate() {
        if idx > 0 {
            builder.push(" OR ");
        }
        builder.push("(");
        push_predicate(builder, predicate);
        builder.push(")");
    }
    builder.push("))");
}

fn push_predicate(builder: &mut QueryBuilder<'static, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::String { mode, value } => match mode {
            StringMatch::Prefix => {
                builder.push("s.value->>'normalized' LIKE ");
                builder.push_bind(format!("{}%", escape_like(&normalize_string(value))));
            }
            StringMatch::Contains => {
                builder.push("s.value->>'normalized' LIKE ");
                builder.push_bind(format!("%{}%", escape_like(&normalize_string(value))));
            }
            StringMatch::Exact => {
                builder.push("s.value->>'exact' = ");
                builder.push_bind(value.clone());
            }
        },
        Predicate::Token { system, code } => {
            builder.push("s.kind = 'token'");
            match system {
                TokenSystem::Any => {}
                TokenSystem::Absent => {
                    builder.push(" AND s.value->>'system' IS NULL");
                }
                TokenSystem::Is(system) => {
                    builder.push(" AND s.value->>'system' = ");
                    builder.push_bind(system.clone());
                }
            }
            if let Some(code) = code {
                builder.push(" AND s.value->>'code' = ");
                builder.push_bind(code.clone());
            }
        }
        Predicate::Date { prefix, start, end } => {
            let start = time_to_chrono(*start);
            let end = time_to_chrono(*end);
            let value_start = "(s.value->>'start')::timestamptz";
            let value_end = "(s.value->>'end')::timestamptz";
            match prefix {
                Prefix::Eq | Prefix::Ne => {
                    if *prefix == Prefix::Ne {
                        builder.push("NOT ");
                    }
                    builder.push(format!("({value_start} >= "));
                    builder.push_bind(start);
                    builder.push(format!(" AND {value_end} <= "));
                    builder.push_bind(end);
                    builder.push(")");
                }
                Prefix::Lt => {
                    builder.push(format!("{value_start} < "));
                    builder.push_bind(start);
                }
                Prefix::Le => {
                    builder.push(format!("{value_start} <= "));
                    builder.push_bind(end);
                }
                Prefix::Gt => {
                    builder.push(format!("{value_end} > "));
                    builder.push_bind(end);
                }
                Prefix::Ge => {
                    builder.push(format!("{value_end} >= "));
                    builder.push_bind(start);
                }
            }
        }
        Predicate::Number { prefix, value } => {
            builder.push("s.kind = 'number' AND ");
            push_numeric(builder, *prefix, *value);
        }
        Predicate::Quantity {
            prefix,
            value,
            system,
            unit,
        } => {
            builder.push("s.kind = 'quantity' AND ");
            push_numeric(builder, *prefix, *value);
            if let Some(system) = system {
                builder.push(" AND s.value->>'system' = ");
                builder.push_bind(system.clone());
            }
            if let Some(unit) = unit {
                builder.push(" AND s.value->>'unit' = ");
                builder.push_bind(unit.clone());
            }
        }
        Predicate::Reference {
            target_type,
            target_id,
        } => {
            builder.push("s.value->>'target_id' = ");
            builder.push_bind(target_id.clone());
            if let Some(target_type) = target_type {
                builder.push(" AND s.value->>'target_type' = ");
                builder.push_bind(target_type.clone());
            }
        }
    }
}

fn push_numeric(builder: &mut QueryBuilder<'static, Postgres>, prefix: Prefix, value: f64) {
    let op = match prefix {
        Prefix::Eq => "=",
        Prefix::Ne => "<>",
        Prefix::Lt => "<",
        Prefix::Le => "<=",
        Prefix::Gt => ">",
        Prefix::Ge => ">=",
    };
    builder.push(format!("(s.value->>'value')::double precision {op} "));
    builder.push_bind(value);
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

//! Value extraction from resource JSON.
//!
//! Each extractor walks the rule's path, then converts every leaf it finds
//! into zero or more typed [`IndexValue`]s. Leaves that do not fit the rule's
//! kind are skipped rather than reported: content shape is validated before
//! indexing, and an unexpected element must not fail the write.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::types::{IndexValue, ValueKind};

/// Extract all values for one rule.
pub fn extract(resource: &Value, path: &str, kind: ValueKind) -> Vec<IndexValue> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Vec::new();
    }

    let mut leaves = Vec::new();
    navigate_json(resource, &segments, 0, &mut leaves);

    let mut out = Vec::new();
    for leaf in leaves {
        match kind {
            ValueKind::String => extract_strings(leaf, &mut out),
            ValueKind::Token => extract_tokens(leaf, &mut out),
            ValueKind::Date => out.extend(extract_date(leaf)),
            ValueKind::Number => out.extend(leaf.as_f64().map(|value| IndexValue::Number { value })),
            ValueKind::Reference => out.extend(extract_reference(leaf)),
            ValueKind::Quantity => out.extend(extract_quantity(leaf)),
        }
    }
    out
}

// ============================================================================
// JSON Navigation
// ============================================================================

/// Navigate JSON following path segments, collecting leaf values.
///
/// Handles arrays transparently: if a segment points to an array,
/// recurse into each element. Also handles polymorphic fields
/// (e.g., `effective` matches `effectiveDateTime`, `effectivePeriod`).
fn navigate_json<'a>(value: &'a Value, segments: &[&str], depth: usize, results: &mut Vec<&'a Value>) {
    if depth >= segments.len() {
        match value {
            Value::Array(arr) => results.extend(arr.iter().filter(|v| !v.is_null())),
            Value::Null => {}
            _ => results.push(value),
        }
        return;
    }

    let segment = segments[depth];

    match value {
        Value::Object(obj) => {
            if let Some(child) = obj.get(segment) {
                navigate_json(child, segments, depth + 1, results);
            } else {
                for (key, child) in obj {
                    if key.len() > segment.len()
                        && key.starts_with(segment)
                        && key.as_bytes()[segment.len()].is_ascii_uppercase()
                    {
                        navigate_json(child, segments, depth + 1, results);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                navigate_json(item, segments, depth, results);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Strings
// ============================================================================

fn push_string(s: &str, out: &mut Vec<IndexValue>) {
    if s.is_empty() {
        return;
    }
    out.push(IndexValue::String {
        normalized: normalize_string(s),
        exact: s.to_string(),
    });
}

fn extract_strings(value: &Value, out: &mut Vec<IndexValue>) {
    match value {
        Value::String(s) => push_string(s, out),
        Value::Object(obj) => {
            // HumanName
            if obj.contains_key("family") || obj.contains_key("given") {
                for field in ["family", "text"] {
                    if let Some(s) = obj.get(field).and_then(Value::as_str) {
                        push_string(s, out);
                    }
                }
                for field in ["given", "prefix", "suffix"] {
                    for s in string_array(obj.get(field)) {
                        push_string(s, out);
                    }
                }
                return;
            }
            // Address
            if obj.contains_key("line") || obj.contains_key("city") {
                for s in string_array(obj.get("line")) {
                    push_string(s, out);
                }
                for field in ["city", "district", "state", "postalCode", "country", "text"] {
                    if let Some(s) = obj.get(field).and_then(Value::as_str) {
                        push_string(s, out);
                    }
                }
                return;
            }
            if let Some(s) = obj.get("text").and_then(Value::as_str) {
                push_string(s, out);
            }
        }
        _ => {}
    }
}

fn string_array(value: Option<&Value>) -> impl Iterator<Item = &str> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// Normalize a string for search: lowercase.
pub fn normalize_string(s: &str) -> String {
    s.to_lowercase()
}

// ============================================================================
// Tokens
// ============================================================================

fn token(system: Option<&str>, code: &str) -> IndexValue {
    IndexValue::Token {
        system: system.filter(|s| !s.is_empty()).map(str::to_string),
        code: code.to_string(),
    }
}

fn extract_tokens(value: &Value, out: &mut Vec<IndexValue>) {
    match value {
        Value::String(code) if !code.is_empty() => out.push(token(None, code)),
        Value::Bool(b) => out.push(token(None, if *b { "true" } else { "false" })),
        Value::Object(obj) => {
            // CodeableConcept
            if let Some(codings) = obj.get("coding").and_then(Value::as_array) {
                for coding in codings {
                    extract_tokens(coding, out);
                }
                return;
            }
            let system = obj.get("system").and_then(Value::as_str);
            // Coding
            if let Some(code) = obj.get("code").and_then(Value::as_str) {
                out.push(token(system, code));
                return;
            }
            // Identifier / ContactPoint
            if let Some(v) = obj.get("value").and_then(Value::as_str) {
                out.push(token(system, v));
            }
        }
        _ => {}
    }
}

// ============================================================================
// Dates
// ============================================================================

fn extract_date(value: &Value) -> Option<IndexValue> {
    let (start, end) = match value {
        Value::String(s) => parse_date_to_range(s)?,
        Value::Object(_) => parse_period_to_range(value)?,
        _ => return None,
    };
    Some(IndexValue::Date { start, end })
}

/// Parse a date, partial date or instant into the range it covers.
///
/// `2024` covers the whole year, `2024-03` the month, `2024-03-15` the day;
/// a full instant is a zero-width range.
pub fn parse_date_to_range(date_str: &str) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let trimmed = date_str.trim();
    let len = trimmed.len();

    if trimmed.contains('T') {
        let instant = OffsetDateTime::parse(trimmed, &Rfc3339).ok()?;
        return Some((instant, instant));
    }

    let (year, first_month, last_month, first_day, last_day) = match len {
        4 => {
            let year: i32 = trimmed.parse().ok()?;
            (year, 1, 12, 1, 31)
        }
        7 if trimmed.as_bytes()[4] == b'-' => {
            let year: i32 = trimmed[..4].parse().ok()?;
            let month: u8 = trimmed[5..7].parse().ok()?;
            if !(1..=12).contains(&month) {
                return None;
            }
            (year, month, month, 1, days_in_month(year, month))
        }
        10 if trimmed.as_bytes()[4] == b'-' && trimmed.as_bytes()[7] == b'-' => {
            let year: i32 = trimmed[..4].parse().ok()?;
            let month: u8 = trimmed[5..7].parse().ok()?;
            let day: u8 = trimmed[8..10].parse().ok()?;
            (year, month, month, day, day)
        }
        _ => return None,
    };

    let start_date = Date::from_calendar_date(year, Month::try_from(first_month).ok()?, first_day).ok()?;
    let end_date = Date::from_calendar_date(year, Month::try_from(last_month).ok()?, last_day).ok()?;
    let end_time = Time::from_hms_milli(23, 59, 59, 999).ok()?;

    Some((
        PrimitiveDateTime::new(start_date, Time::MIDNIGHT).assume_utc(),
        PrimitiveDateTime::new(end_date, end_time).assume_utc(),
    ))
}

/// Parse a Period into start/end timestamps.
fn parse_period_to_range(period: &Value) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let start = period
        .get("start")
        .and_then(Value::as_str)
        .and_then(|s| parse_date_to_range(s).map(|r| r.0));

    let end = period
        .get("end")
        .and_then(Value::as_str)
        .and_then(|e| parse_date_to_range(e).map(|r| r.1));

    match (start, end) {
        (Some(s), Some(e)) => Some((s, e)),
        (Some(s), None) => Some((s, s)),
        (None, Some(e)) => Some((e, e)),
        (None, None) => None,
    }
}

/// Get number of days in a month.
fn days_in_month(year: i32, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

// ============================================================================
// References and quantities
// ============================================================================

fn extract_reference(value: &Value) -> Option<IndexValue> {
    let reference = value.get("reference").and_then(Value::as_str)?;
    parse_reference(reference).map(|(target_type, target_id)| IndexValue::Reference {
        target_type,
        target_id,
    })
}

/// Split a reference string into `(type, id)`.
///
/// Accepts `Type/id`, absolute URLs ending in `Type/id`, and versioned
/// references (`Type/id/_history/n`). Contained references (`#x`) are not
/// indexable.
pub fn parse_reference(reference: &str) -> Option<(Option<String>, String)> {
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    let without_version = match reference.find("/_history/") {
        Some(idx) => &reference[..idx],
        None => reference,
    };
    let mut parts = without_version.rsplit('/');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let target_type = parts
        .next()
        .filter(|s| s.chars().next().is_some_and(|c| c.is_ascii_uppercase()))
        .map(str::to_string);
    Some((target_type, id.to_string()))
}

fn extract_quantity(value: &Value) -> Option<IndexValue> {
    let amount = value.get("value").and_then(Value::as_f64)?;
    let system = value.get("system").and_then(Value::as_str).map(str::to_string);
    let unit = value
        .get("code")
        .or_else(|| value.get("unit"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(IndexValue::Quantity {
        value: amount,
        system,
        unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_navigate_polymorphic_and_arrays() {
        let obs = json!({
            "effectiveDateTime": "2024-03-15T10:00:00Z",
            "component": [
                {"valueQuantity": {"value": 120, "unit": "mmHg"}},
                {"valueQuantity": {"value": 80, "unit": "mmHg"}}
            ]
        });
        let dates = extract(&obs, "effective", ValueKind::Date);
        assert_eq!(dates.len(), 1);

        let quantities = extract(&obs, "component.valueQuantity", ValueKind::Quantity);
        assert_eq!(quantities.len(), 2);
    }

    #[test]
    fn test_date_precision_ranges() {
        let (s, e) = parse_date_to_range("2024").unwrap();
        assert_eq!(s, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(e, datetime!(2024-12-31 23:59:59.999 UTC));

        let (s, e) = parse_date_to_range("2024-02").unwrap();
        assert_eq!(s, datetime!(2024-02-01 0:00 UTC));
        assert_eq!(e, datetime!(2024-02-29 23:59:59.999 UTC));

        let (s, e) = parse_date_to_range("2023-02-15").unwrap();
        assert_eq!(s, datetime!(2023-02-15 0:00 UTC));
        assert_eq!(e, datetime!(2023-02-15 23:59:59.999 UTC));

        let (s, e) = parse_date_to_range("2024-03-15T10:30:00+02:00").unwrap();
        assert_eq!(s, e);
        assert_eq!(s, datetime!(2024-03-15 8:30 UTC));
    }

    #[test]
    fn test_invalid_dates() {
        assert!(parse_date_to_range("2024-13").is_none());
        assert!(parse_date_to_range("2023-02-30").is_none());
        assert!(parse_date_to_range("yesterday").is_none());
        assert!(parse_date_to_range("2024-03-15T10:00:00").is_none());
    }

    #[test]
    fn test_period_extraction() {
        let enc = json!({"period": {"start": "2024-01-01", "end": "2024-01-03"}});
        let values = extract(&enc, "period", ValueKind::Date);
        assert_eq!(
            values,
            vec![IndexValue::Date {
                start: datetime!(2024-01-01 0:00 UTC),
                end: datetime!(2024-01-03 23:59:59.999 UTC),
            }]
        );
    }

    #[test]
    fn test_human_name_strings() {
        let patient = json!({
            "name": [
                {"family": "Smith", "given": ["John", "Q"]},
                {"text": "Johnny"}
            ]
        });
        let values = extract(&patient, "name", ValueKind::String);
        let exact: Vec<_> = values
            .iter()
            .map(|v| match v {
                IndexValue::String { exact, .. } => exact.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(exact, vec!["Smith", "John", "Q", "Johnny"]);
    }

    #[test]
    fn test_codeable_concept_tokens() {
        let obs = json!({
            "code": {"coding": [
                {"system": "http://loinc.org", "code": "8867-4"},
                {"system": "http://snomed.info/sct", "code": "364075005"}
            ]}
        });
        let values = extract(&obs, "code", ValueKind::Token);
        assert_eq!(values.len(), 2);
        assert_eq!(
            values[0],
            IndexValue::Token {
                system: Some("http://loinc.org".into()),
                code: "8867-4".into()
            }
        );
    }

    #[test]
    fn test_plain_code_and_boolean_tokens() {
        let patient = json!({"gender": "female", "active": true});
        assert_eq!(
            extract(&patient, "gender", ValueKind::Token),
            vec![IndexValue::Token { system: None, code: "female".into() }]
        );
        assert_eq!(
            extract(&patient, "active", ValueKind::Token),
            vec![IndexValue::Token { system: None, code: "true".into() }]
        );
    }

    #[test]
    fn test_identifier_tokens() {
        let patient = json!({"identifier": [{"system": "urn:mrn", "value": "123"}]});
        assert_eq!(
            extract(&patient, "identifier", ValueKind::Token),
            vec![IndexValue::Token { system: Some("urn:mrn".into()), code: "123".into() }]
        );
    }

    #[test]
    fn test_parse_reference_forms() {
        assert_eq!(
            parse_reference("Patient/123"),
            Some((Some("Patient".into()), "123".into()))
        );
        assert_eq!(
            parse_reference("https://example.org/fhir/Patient/123/_history/2"),
            Some((Some("Patient".into()), "123".into()))
        );
        assert_eq!(parse_reference("123"), Some((None, "123".into())));
        assert_eq!(parse_reference("#contained"), None);
        assert_eq!(parse_reference(""), None);
    }

    #[test]
    fn test_quantity_prefers_code_unit() {
        let obs = json!({"valueQuantity": {"value": 5.4, "unit": "mmol/L", "system": "http://unitsofmeasure.org", "code": "mmol/L"}});
        assert_eq!(
            extract(&obs, "valueQuantity", ValueKind::Quantity),
            vec![IndexValue::Quantity {
                value: 5.4,
                system: Some("http://unitsofmeasure.org".into()),
                unit: Some("mmol/L".into())
            }]
        );
    }

    #[test]
    fn test_missing_path_yields_nothing() {
        let patient = json!({"name": [{"family": "Smith"}]});
        assert!(extract(&patient, "birthDate", ValueKind::Date).is_empty());
        assert!(extract(&patient, "", ValueKind::String).is_empty());
    }
}

//! Extraction-rule catalog keyed by resource type.
//!
//! The catalog is a static table resolved once on first use. Types without an
//! entry are intentionally unindexed (for example `AuditEvent`); indexing them
//! produces no rows.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::types::{ExtractionRule, ValueKind};

macro_rules! rules {
    ($($param:literal => $path:literal : $kind:ident),* $(,)?) => {
        &[$(ExtractionRule { param: $param, path: $path, kind: ValueKind::$kind }),*]
    };
}

/// Rules shared by every indexed type.
pub static COMMON_RULES: &[ExtractionRule] = rules![
    "_lastUpdated" => "meta.lastUpdated": Date,
    "_tag" => "meta.tag": Token,
];

static TYPE_RULES: &[(&str, &[ExtractionRule])] = &[
    ("Communication", rules![
        "status" => "status": Token,
        "subject" => "subject": Reference,
        "sender" => "sender": Reference,
        "recipient" => "recipient": Reference,
        "sent" => "sent": Date,
    ]),
    ("Condition", rules![
        "code" => "code": Token,
        "subject" => "subject": Reference,
        "encounter" => "encounter": Reference,
        "clinical-status" => "clinicalStatus": Token,
        "onset-date" => "onset": Date,
        "recorded-date" => "recordedDate": Date,
    ]),
    ("DiagnosticReport", rules![
        "code" => "code": Token,
        "status" => "status": Token,
        "subject" => "subject": Reference,
        "date" => "effective": Date,
        "issued" => "issued": Date,
        "result" => "result": Reference,
    ]),
    ("DocumentReference", rules![
        "status" => "status": Token,
        "subject" => "subject": Reference,
        "type" => "type": Token,
        "date" => "date": Date,
        "description" => "description": String,
    ]),
    ("DomainConfiguration", rules![
        "domain" => "domain": Token,
    ]),
    ("Encounter", rules![
        "status" => "status": Token,
        "class" => "class": Token,
        "subject" => "subject": Reference,
        "date" => "period": Date,
        "participant" => "participant.individual": Reference,
        "service-provider" => "serviceProvider": Reference,
    ]),
    ("MedicationRequest", rules![
        "status" => "status": Token,
        "intent" => "intent": Token,
        "subject" => "subject": Reference,
        "code" => "medicationCodeableConcept": Token,
        "authoredon" => "authoredOn": Date,
        "requester" => "requester": Reference,
    ]),
    ("Observation", rules![
        "code" => "code": Token,
        "status" => "status": Token,
        "category" => "category": Token,
        "subject" => "subject": Reference,
        "encounter" => "encounter": Reference,
        "performer" => "performer": Reference,
        "date" => "effective": Date,
        "value-quantity" => "valueQuantity": Quantity,
        "value-concept" => "valueCodeableConcept": Token,
        "value-string" => "valueString": String,
        "component-value-quantity" => "component.valueQuantity": Quantity,
    ]),
    ("Organization", rules![
        "name" => "name": String,
        "identifier" => "identifier": Token,
        "partof" => "partOf": Reference,
    ]),
    ("Patient", rules![
        "identifier" => "identifier": Token,
        "name" => "name": String,
        "family" => "name.family": String,
        "given" => "name.given": String,
        "gender" => "gender": Token,
        "birthdate" => "birthDate": Date,
        "active" => "active": Token,
        "address" => "address": String,
        "address-city" => "address.city": String,
        "telecom" => "telecom": Token,
        "general-practitioner" => "generalPractitioner": Reference,
        "organization" => "managingOrganization": Reference,
        "multiple-birth-order" => "multipleBirthInteger": Number,
    ]),
    ("Practitioner", rules![
        "identifier" => "identifier": Token,
        "name" => "name": String,
        "family" => "name.family": String,
        "given" => "name.given": String,
    ]),
    ("Project", rules![
        "name" => "name": String,
    ]),
    ("ServiceRequest", rules![
        "status" => "status": Token,
        "intent" => "intent": Token,
        "code" => "code": Token,
        "subject" => "subject": Reference,
        "authored" => "authoredOn": Date,
    ]),
    ("Subscription", rules![
        "status" => "status": Token,
        "criteria" => "criteria": String,
        "type" => "channel.type": Token,
    ]),
    ("Task", rules![
        "status" => "status": Token,
        "intent" => "intent": Token,
        "code" => "code": Token,
        "owner" => "owner": Reference,
        "focus" => "focus": Reference,
        "authored-on" => "authoredOn": Date,
        "priority" => "priority": Token,
    ]),
    ("User", rules![
        "email" => "email": Token,
        "name" => "firstName": String,
    ]),
];

static CATALOG: LazyLock<HashMap<&'static str, Vec<ExtractionRule>>> = LazyLock::new(|| {
    TYPE_RULES
        .iter()
        .map(|(resource_type, rules)| {
            let mut all = Vec::with_capacity(COMMON_RULES.len() + rules.len());
            all.extend_from_slice(COMMON_RULES);
            all.extend_from_slice(rules);
            (*resource_type, all)
        })
        .collect()
});

/// Returns the ordered extraction rules for a resource type, if it is indexed.
pub fn rules_for(resource_type: &str) -> Option<&'static [ExtractionRule]> {
    CATALOG.get(resource_type).map(Vec::as_slice)
}

/// Returns the value kind of a search parameter on a resource type.
pub fn param_kind(resource_type: &str, param: &str) -> Option<ValueKind> {
    rules_for(resource_type)?
        .iter()
        .find(|rule| rule.param == param)
        .map(|rule| rule.kind)
}

/// Returns the names of all indexed resource types.
pub fn indexed_types() -> impl Iterator<Item = &'static str> {
    TYPE_RULES.iter().map(|(resource_type, _)| *resource_type)
}

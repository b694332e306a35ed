//! Closed catalog of resource types and the shape contract each one declares.
//!
//! The catalog is intentionally small and static: a write for a type that is
//! not listed here is rejected before it reaches storage. Shape checks only
//! cover structure (object-ness, required elements, element kinds); they do
//! not validate clinical meaning.

use serde_json::Value;

use crate::error::{CoreError, Result};

/// Where lineages of a resource type live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// Platform-wide records stored on the global shard.
    Platform,
    /// Records partitioned by tenant.
    Tenant,
}

/// Expected JSON kind of a required element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    String,
    Object,
    Array,
    Any,
}

impl ElementKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ElementKind::String => value.is_string(),
            ElementKind::Object => value.is_object(),
            ElementKind::Array => value.is_array(),
            ElementKind::Any => !value.is_null(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ElementKind::String => "string",
            ElementKind::Object => "object",
            ElementKind::Array => "array",
            ElementKind::Any => "value",
        }
    }
}

/// A required element, addressed by a dotted path from the resource root.
#[derive(Debug, Clone, Copy)]
pub struct RequiredElement {
    pub path: &'static str,
    pub kind: ElementKind,
}

/// Declared shape of one resource type.
#[derive(Debug, Clone, Copy)]
pub struct TypeDefinition {
    pub name: &'static str,
    pub scope: ResourceScope,
    pub required: &'static [RequiredElement],
}

macro_rules! catalog {
    ($($scope:ident $name:literal { $($path:literal : $kind:ident),* }),* $(,)?) => {
        &[$(
            TypeDefinition {
                name: $name,
                scope: ResourceScope::$scope,
                required: &[$(RequiredElement { path: $path, kind: ElementKind::$kind }),*],
            }
        ),*]
    };
}

static CATALOG: &[TypeDefinition] = catalog![
    Platform "Project" { "name": String },
    Platform "User" { "email": String },
    Platform "ClientApplication" {},
    Platform "DomainConfiguration" { "domain": String },
    Tenant "AuditEvent" { "type": Object, "recorded": String },
    Tenant "Communication" { "status": String },
    Tenant "Condition" { "subject": Object },
    Tenant "DiagnosticReport" { "status": String, "code": Object },
    Tenant "DocumentReference" { "status": String, "content": Array },
    Tenant "Encounter" { "status": String },
    Tenant "MedicationRequest" { "status": String, "intent": String, "subject": Object },
    Tenant "Observation" { "status": String, "code": Object },
    Tenant "Organization" {},
    Tenant "Patient" {},
    Tenant "Practitioner" {},
    Tenant "ServiceRequest" { "status": String, "intent": String, "subject": Object },
    Tenant "Subscription" { "status": String, "criteria": String, "channel.type": String },
    Tenant "Task" { "status": String, "intent": String },
];

/// Looks up a resource type in the catalog.
pub fn lookup_type(name: &str) -> Option<&'static TypeDefinition> {
    CATALOG.iter().find(|def| def.name == name)
}

/// Returns every known resource type name.
pub fn known_types() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|def| def.name)
}

/// Returns the storage scope of a resource type.
pub fn scope_of(resource_type: &str) -> Result<ResourceScope> {
    lookup_type(resource_type)
        .map(|def| def.scope)
        .ok_or_else(|| CoreError::invalid_resource_type(resource_type))
}

/// Validates resource content against the declared shape for its type.
///
/// `resourceType` may be omitted from the content; when present it must match.
pub fn validate_shape(resource_type: &str, content: &Value) -> Result<()> {
    let def = lookup_type(resource_type)
        .ok_or_else(|| CoreError::invalid_resource_type(resource_type))?;

    let obj = content
        .as_object()
        .ok_or_else(|| CoreError::invalid_resource("resource content must be a JSON object"))?;

    if let Some(declared) = obj.get("resourceType") {
        match declared.as_str() {
            Some(t) if t == resource_type => {}
            Some(t) => {
                return Err(CoreError::invalid_resource(format!(
                    "resourceType '{t}' does not match '{resource_type}'"
                )));
            }
            None => return Err(CoreError::invalid_resource("resourceType must be a string")),
        }
    }

    if let Some(meta) = obj.get("meta")
        && !meta.is_object()
    {
        return Err(CoreError::invalid_resource("meta must be an object"));
    }

    for element in def.required {
        match lookup_path(content, element.path) {
            None => {
                return Err(CoreError::invalid_resource(format!(
                    "{resource_type}.{} is required",
                    element.path
                )));
            }
            Some(value) if !element.kind.accepts(value) => {
                return Err(CoreError::invalid_resource(format!(
                    "{resource_type}.{} must be a {}",
                    element.path,
                    element.kind.as_str()
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

//! Base-job-template rendering.
//!
//! A base job template is a JSON document with two sections: a
//! `job_configuration` tree containing `{{ name }}` placeholders, and a
//! `variables` JSON schema describing the values that may be substituted.
//! Rendering is structural: it never looks at configuration field names.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use uuid::Uuid;

/// Resolves opaque block-document references to their stored values.
///
/// Block documents live in a secret-like store; the worker only ever sees
/// them through this seam.
#[async_trait::async_trait]
pub trait BlockDocumentResolver: Send + Sync {
    /// Fetch the data of a single block document.
    async fn resolve_block_document(&self, block_document_id: Uuid) -> anyhow::Result<Value>;
}

/// Default values pulled from `variables.properties[*].default`.
pub fn schema_defaults(variables_schema: &Value) -> Map<String, Value> {
    let mut defaults = Map::new();
    if let Some(properties) = variables_schema.get("properties").and_then(Value::as_object) {
        for (name, attrs) in properties {
            if let Some(default) = attrs.get("default") {
                defaults.insert(name.clone(), default.clone());
            }
        }
    }
    defaults
}

/// Builds a `job_configuration` template from a variables schema.
///
/// Each property maps to a `{{ name }}` placeholder, unless the property
/// carries an explicit `template` override.
pub fn json_template(variables_schema: &Value) -> Value {
    let mut configuration = Map::new();
    if let Some(properties) = variables_schema.get("properties").and_then(Value::as_object) {
        for (name, attrs) in properties {
            let template = attrs
                .get("template")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{{{{ {name} }}}}"));
            configuration.insert(name.clone(), Value::String(template));
        }
    }
    Value::Object(configuration)
}

/// Substitutes `values` into a template tree.
///
/// A string that consists of a single placeholder is replaced by the value
/// itself, preserving its type; a placeholder with no value removes the
/// surrounding key (or array element). Placeholders embedded in longer
/// strings are replaced textually, with missing values rendered empty.
pub fn apply_values(template: &Value, values: &Map<String, Value>) -> Value {
    render(template, values).unwrap_or(Value::Null)
}

/// Replaces block-document references anywhere inside `values` with the
/// documents the resolver returns.
///
/// A reference is an object of the form `{"$ref": {"block_document_id": id}}`.
pub async fn resolve_block_document_references(
    values: Map<String, Value>,
    resolver: &dyn BlockDocumentResolver,
) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    for (name, value) in values {
        out.insert(name, resolve_value(value, resolver).await?);
    }
    Ok(out)
}

fn render(value: &Value, values: &Map<String, Value>) -> Option<Value> {
    match value {
        Value::String(text) => render_string(text, values),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, nested) in map {
                if let Some(rendered) = render(nested, values) {
                    out.insert(key.clone(), rendered);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| render(item, values)).collect(),
        )),
        other => Some(other.clone()),
    }
}

fn render_string(text: &str, values: &Map<String, Value>) -> Option<Value> {
    let placeholders = find_placeholders(text);
    if placeholders.is_empty() {
        return Some(Value::String(text.to_string()));
    }

    // A lone placeholder substitutes the value with its type intact.
    if let [(start, end, name)] = placeholders.as_slice() {
        if text[..*start].trim().is_empty() && text[*end..].trim().is_empty() {
            return values.get(name).cloned();
        }
    }

    let mut out = String::new();
    let mut cursor = 0;
    for (start, end, name) in &placeholders {
        out.push_str(&text[cursor..*start]);
        if let Some(value) = values.get(name) {
            out.push_str(&value_to_string(value));
        }
        cursor = *end;
    }
    out.push_str(&text[cursor..]);
    Some(Value::String(out))
}

fn find_placeholders(text: &str) -> Vec<(usize, usize, String)> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find("{{") {
        let open = cursor + open;
        let Some(close) = text[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        out.push((open, close + 2, text[open + 2..close].trim().to_string()));
        cursor = close + 2;
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn resolve_value<'a>(
    value: Value,
    resolver: &'a dyn BlockDocumentResolver,
) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::Object(map) => {
                if let Some(id) = block_document_id(&map) {
                    return resolver.resolve_block_document(id).await;
                }
                let mut out = Map::new();
                for (key, nested) in map {
                    out.insert(key, resolve_value(nested, resolver).await?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(item, resolver).await?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other),
        }
    })
}

fn block_document_id(map: &Map<String, Value>) -> Option<Uuid> {
    if map.len() != 1 {
        return None;
    }
    let reference = map.get("$ref")?;
    let id = match reference {
        Value::Object(inner) => inner.get("block_document_id")?,
        other => other,
    };
    id.as_str().and_then(|raw| Uuid::parse_str(raw).ok())
}

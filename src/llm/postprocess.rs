//! Response validation and post-processing.
//!
//! A [`PostProcessor`] turns a raw backend reply into the value worth caching,
//! or rejects it by returning `None`. The retrying caller runs processors in
//! order and treats any rejection as a reason to try the call again.

use serde_json::Value;

use crate::utils::json_extraction::{analyze_json_structure, extract_json};

/// One validation or transformation step applied to a backend reply.
pub trait PostProcessor: Send + Sync {
    /// Transform `value`, or return `None` to reject it.
    fn process(&self, value: Value) -> Option<Value>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> PostProcessor for F
where
    F: Fn(Value) -> Option<Value> + Send + Sync,
{
    fn process(&self, value: Value) -> Option<Value> {
        self(value)
    }
}

/// Parses the JSON payload out of a text reply.
///
/// Non-string values are passed through when they are already objects or
/// arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractJson;

impl PostProcessor for ExtractJson {
    fn process(&self, value: Value) -> Option<Value> {
        match value {
            Value::String(text) => {
                let extracted = extract_json(&text);
                if extracted.is_none() && analyze_json_structure(&text).is_truncated() {
                    tracing::debug!(len = text.len(), "Reply looks like truncated JSON");
                }
                extracted
            }
            Value::Object(_) | Value::Array(_) => Some(value),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        "extract_json"
    }
}

/// Requires an object carrying every named field.
///
/// An array passes when every element is such an object and it is not empty.
#[derive(Debug, Clone, Default)]
pub struct RequireFields {
    fields: Vec<String>,
}

impl RequireFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn has_fields(&self, value: &Value) -> bool {
        match value.as_object() {
            Some(object) => self.fields.iter().all(|f| object.contains_key(f)),
            None => false,
        }
    }
}

impl PostProcessor for RequireFields {
    fn process(&self, value: Value) -> Option<Value> {
        let ok = match &value {
            Value::Array(items) => !items.is_empty() && items.iter().all(|v| self.has_fields(v)),
            other => self.has_fields(other),
        };
        if ok {
            Some(value)
        } else {
            tracing::debug!(fields = ?self.fields, "Reply is missing required fields");
            None
        }
    }

    fn name(&self) -> &str {
        "require_fields"
    }
}

/// Run `processors` in order, stopping at the first rejection.
pub fn apply_all<P>(processors: &[P], value: Value) -> Result<Value, String>
where
    P: AsRef<dyn PostProcessor>,
{
    processors.iter().try_fold(value, |value, processor| {
        let processor = processor.as_ref();
        processor
            .process(value)
            .ok_or_else(|| processor.name().to_string())
    })
}

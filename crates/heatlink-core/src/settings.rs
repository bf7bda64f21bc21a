//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Setting update requests and write outcomes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::warn;

/// One requested change: `{"set": value, "id": confirmationId}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingUpdate {
    /// Raw requested value; coerced when the key is processed.
    pub set: Value,
    pub id: String,
}

impl SettingUpdate {
    /// Numbers and numeric strings are accepted; fractional values are not.
    pub fn value(&self) -> Option<i64> {
        coerce_integer(&self.set)
    }
}

/// Batch keyed by external field id, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingUpdateRequest {
    pub updates: IndexMap<String, SettingUpdate>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("setting update must be a JSON object")]
    NotAnObject,
    #[error("invalid setting update json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SettingUpdateRequest {
    pub fn insert(&mut self, key: impl Into<String>, set: Value, id: impl Into<String>) {
        self.updates.insert(
            key.into(),
            SettingUpdate {
                set,
                id: id.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Entries without a usable confirmation id cannot be acknowledged and are skipped.
    pub fn from_json(value: &Value) -> Result<Self, SettingsError> {
        let object = value.as_object().ok_or(SettingsError::NotAnObject)?;
        let mut request = Self::default();
        for (key, entry) in object {
            let Some(id) = entry.get("id").and_then(confirmation_id) else {
                warn!(key = %key, "setting update without confirmation id ignored");
                continue;
            };
            let set = entry.get("set").cloned().unwrap_or(Value::Null);
            request.insert(key.clone(), set, id);
        }
        Ok(request)
    }

    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_json(&value)
    }
}

fn confirmation_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Result of one key of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Confirmed(String),
    Failed(String),
}

impl WriteOutcome {
    /// The caller's id, without any failure marker.
    pub fn id(&self) -> &str {
        match self {
            WriteOutcome::Confirmed(id) | WriteOutcome::Failed(id) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, WriteOutcome::Confirmed(_))
    }

    /// Id as sent back to the caller; failures carry an `E` prefix.
    pub fn wire_id(&self) -> String {
        match self {
            WriteOutcome::Confirmed(id) => id.clone(),
            WriteOutcome::Failed(id) => format!("E{id}"),
        }
    }
}

/// Where a finished batch is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRoute {
    /// Ordinary confirmation for the backend.
    Backend,
    /// Acknowledgement for the controller-facing channel.
    Device,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub outcomes: Vec<WriteOutcome>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn wire_ids(&self) -> Vec<String> {
        self.outcomes.iter().map(WriteOutcome::wire_id).collect()
    }

    /// `{"id": [..]}` confirmation message.
    pub fn to_json(&self) -> Value {
        json!({ "id": self.wire_ids() })
    }

    /// Routed by the first outcome only, matching what upstream senders expect.
    pub fn route(&self, sentinel: &str) -> AckRoute {
        match self.outcomes.first() {
            Some(first) if first.id() == sentinel => AckRoute::Device,
            _ => AckRoute::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_keep_key_order_and_accept_loose_types() {
        let request = SettingUpdateRequest::parse(
            r#"{"DVI10": {"set": "35", "id": 17}, "B1": {"set": 2, "id": "a9"}, "PISWup": {"set": "1"}}"#,
        )
        .unwrap();
        let keys: Vec<&str> = request.updates.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["DVI10", "B1"]);
        assert_eq!(request.updates["DVI10"].value(), Some(35));
        assert_eq!(request.updates["DVI10"].id, "17");
        assert_eq!(request.updates["B1"].value(), Some(2));
    }

    #[test]
    fn fractional_or_garbage_values_do_not_coerce() {
        let mut request = SettingUpdateRequest::default();
        request.insert("B1", json!(21.5), "1");
        request.insert("B2", json!("warm"), "2");
        request.insert("B3", json!("4.0"), "3");
        assert_eq!(request.updates["B1"].value(), None);
        assert_eq!(request.updates["B2"].value(), None);
        assert_eq!(request.updates["B3"].value(), Some(4));
    }

    #[test]
    fn sentinel_routing_uses_the_first_outcome() {
        let device = WriteBatch {
            outcomes: vec![
                WriteOutcome::Failed("1000".into()),
                WriteOutcome::Confirmed("7".into()),
            ],
        };
        assert_eq!(device.route("1000"), AckRoute::Device);
        assert_eq!(device.to_json(), json!({"id": ["E1000", "7"]}));

        let backend = WriteBatch {
            outcomes: vec![
                WriteOutcome::Confirmed("7".into()),
                WriteOutcome::Confirmed("1000".into()),
            ],
        };
        assert_eq!(backend.route("1000"), AckRoute::Backend);
        assert_eq!(WriteBatch::default().route("1000"), AckRoute::Backend);
    }
}

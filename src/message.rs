use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const MSG_ID: &str = "_msgid";
const PAYLOAD: &str = "payload";
const INTERNAL: &str = "_internal";
const SYNCHRONOUS_OUTPUT: &str = "synchronousOutput";

/// A message travelling along wires: an open object with a `payload`, an id
/// and an `_internal` section reserved for the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        let mut fields = Map::new();
        fields.insert(MSG_ID.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        fields.insert(PAYLOAD.to_string(), payload);
        Self { fields }
    }

    /// Wrap a value received over the wire. Objects are taken as-is and get an
    /// id if they lack one; anything else becomes the payload of a new message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => {
                let mut msg = Self { fields };
                if !msg.fields.contains_key(MSG_ID) {
                    msg.fields.insert(MSG_ID.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
                }
                msg
            }
            other => Self::new(other),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(MSG_ID).and_then(Value::as_str)
    }

    pub fn payload(&self) -> &Value {
        self.fields.get(PAYLOAD).unwrap_or(&Value::Null)
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.fields.insert(PAYLOAD.to_string(), payload);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Set when the message was emitted synchronously; downstream hops stay
    /// synchronous until a node clears it.
    pub fn is_synchronous_output(&self) -> bool {
        self.fields
            .get(INTERNAL)
            .and_then(|internal| internal.get(SYNCHRONOUS_OUTPUT))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_synchronous_output(&mut self, synchronous: bool) {
        if synchronous {
            let internal = self.fields.entry(INTERNAL).or_insert_with(|| json!({}));
            if !internal.is_object() {
                *internal = json!({});
            }
            if let Some(map) = internal.as_object_mut() {
                map.insert(SYNCHRONOUS_OUTPUT.to_string(), Value::Bool(true));
            }
        } else if let Some(map) = self.fields.get_mut(INTERNAL).and_then(Value::as_object_mut) {
            map.remove(SYNCHRONOUS_OUTPUT);
            if map.is_empty() {
                self.fields.remove(INTERNAL);
            }
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_id_and_payload() {
        let msg = Message::new(json!({"key": "value"}));
        assert!(msg.id().is_some());
        assert_eq!(msg.payload(), &json!({"key": "value"}));
        assert!(!msg.is_synchronous_output());
    }

    #[test]
    fn wire_objects_are_kept() {
        let msg = Message::from_value(json!({"_msgid": "m1", "payload": 5, "topic": "t"}));
        assert_eq!(msg.id(), Some("m1"));
        assert_eq!(msg.get("topic"), Some(&json!("t")));

        let scalar = Message::from_value(json!(12));
        assert_eq!(scalar.payload(), &json!(12));
    }

    #[test]
    fn synchronous_marker_round_trip() {
        let mut msg = Message::new(json!(1));
        msg.set_synchronous_output(true);
        assert!(msg.is_synchronous_output());
        assert_eq!(msg.to_value()["_internal"]["synchronousOutput"], json!(true));

        msg.set_synchronous_output(false);
        assert!(!msg.is_synchronous_output());
        assert!(msg.get("_internal").is_none());
    }
}

//! Extraction payloads returned by the remote service.
//!
//! The answer text is untyped JSON. [`parse_answer`] turns it into a
//! [`Value`] and [`Extraction::from_value`] views that value as the five
//! expected top-level arrays. Anything that is not a JSON object is kept
//! as [`Extraction::Foreign`] and contributes nothing to a merge.

use serde_json::{Map, Value};

/// Parse the accumulated answer text of one call.
///
/// Surrounding whitespace is trimmed and a fenced code block has its first
/// and last lines dropped. An empty answer parses to `{}`. If the value
/// has an object under `extraction`, that object is returned instead.
pub fn parse_answer(answer: &str) -> Result<Value, serde_json::Error> {
    let mut body = answer.trim();
    let unfenced;
    if body.starts_with("```") {
        let lines: Vec<&str> = body.split('\n').collect();
        if lines.len() > 2 {
            unfenced = lines[1..lines.len() - 1].join("\n");
            body = &unfenced;
        }
    }

    if body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let parsed: Value = serde_json::from_str(body)?;
    match parsed {
        Value::Object(mut obj) if obj.get("extraction").is_some_and(Value::is_object) => {
            Ok(obj.remove("extraction").unwrap_or_default())
        }
        other => Ok(other),
    }
}

/// A section payload viewed by its expected fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Fields(ExtractionFields),
    /// Payload whose top level is not an object.
    Foreign(Value),
}

/// The five expected arrays. A field is `None` when the key is missing or
/// not an array; entity lists keep only object elements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractionFields {
    pub time_anchors: Option<Vec<Value>>,
    pub people: Option<Vec<Map<String, Value>>>,
    pub places: Option<Vec<Map<String, Value>>>,
    pub relations: Option<Vec<Map<String, Value>>>,
    pub events: Option<Vec<Map<String, Value>>>,
}

impl Extraction {
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Extraction::Foreign(value.clone());
        };

        Extraction::Fields(ExtractionFields {
            time_anchors: obj.get("time_anchors").and_then(Value::as_array).cloned(),
            people: objects(obj, "people"),
            places: objects(obj, "places"),
            relations: objects(obj, "relations"),
            events: objects(obj, "events"),
        })
    }

    pub fn fields(&self) -> Option<&ExtractionFields> {
        match self {
            Extraction::Fields(f) => Some(f),
            Extraction::Foreign(_) => None,
        }
    }
}

fn objects(obj: &Map<String, Value>, key: &str) -> Option<Vec<Map<String, Value>>> {
    obj.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block_is_stripped() {
        let v = parse_answer("```json\n{\"a\":1}\n```").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn test_fenced_block_with_surrounding_whitespace() {
        let v = parse_answer("\n  ```\n{\"people\": []}\n```  \n").unwrap();
        assert_eq!(v, json!({"people": []}));
    }

    #[test]
    fn test_extraction_wrapper_unwrapped() {
        let v = parse_answer(r#"{"extraction": {"events": []}, "note": "x"}"#).unwrap();
        assert_eq!(v, json!({"events": []}));

        let v = parse_answer(r#"{"extraction": [1], "events": []}"#).unwrap();
        assert_eq!(v, json!({"extraction": [1], "events": []}));
    }

    #[test]
    fn test_empty_answer_is_empty_object() {
        assert_eq!(parse_answer("   ").unwrap(), json!({}));
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(parse_answer("好的，以下是抽取结果").is_err());
        assert!(parse_answer("```json\n{\"a\":\n```").is_err());
    }

    #[test]
    fn test_view_keeps_present_fields() {
        let e = Extraction::from_value(&json!({
            "people": [{"name": "李治"}, "stray"],
            "events": "not a list",
            "time_anchors": [{"text": "貞觀"}]
        }));
        let f = e.fields().unwrap();
        assert_eq!(f.people.as_ref().unwrap().len(), 1);
        assert!(f.events.is_none());
        assert!(f.places.is_none());
        assert_eq!(f.time_anchors.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_payload() {
        assert!(matches!(
            Extraction::from_value(&json!([1, 2])),
            Extraction::Foreign(_)
        ));
    }
}

//! Tipos de dados trocados com os adaptadores de ferramentas.
//!
//! [`ToolRequest`] é o corpo JSON enviado a cada ferramenta externa e
//! [`ToolOutput`] o mapa devolvido, repassado às tarefas dependentes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque tool result; merged key-by-key into dependent task inputs.
pub type ToolOutput = Map<String, Value>;

/// One call to one tool for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    pub task_id: String,
    /// Task parameters overlaid with the outputs of its dependencies.
    pub input: Map<String, Value>,
}

impl ToolRequest {
    pub fn new(
        tool: impl Into<String>,
        task_id: impl Into<String>,
        input: Map<String, Value>,
    ) -> Self {
        Self {
            tool: tool.into(),
            task_id: task_id.into(),
            input,
        }
    }
}

/// Normalises a response body into a [`ToolOutput`]; non-object bodies are
/// wrapped under `"result"`.
pub fn into_output(body: Value) -> ToolOutput {
    match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_flat() {
        let mut input = Map::new();
        input.insert("prompt".into(), json!("lofi"));
        let req = ToolRequest::new("musicgen", "gen", input);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"tool": "musicgen", "task_id": "gen", "input": {"prompt": "lofi"}})
        );
    }

    #[test]
    fn non_object_bodies_are_wrapped() {
        let out = into_output(json!(["a", "b"]));
        assert_eq!(out.get("result"), Some(&json!(["a", "b"])));

        let out = into_output(json!({"audio_url": "s3://x"}));
        assert_eq!(out.get("audio_url"), Some(&json!("s3://x")));
    }
}

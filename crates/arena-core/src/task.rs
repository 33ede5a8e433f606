//! Task definitions.

use arena_target::{FunctionCall, TargetRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// What to provision, how to prepare it, and how to score it.
///
/// Immutable once handed to an environment.
///
/// JSON form:
///
/// ```json
/// {
///   "prompt": "Mark the first todo as done",
///   "target": {"custom_gym": {"location": "local", "source": {"image": "acme/todo:1"}}},
///   "setup": [{"name": "open_url", "args": ["http://localhost:3000"]}],
///   "evaluate": [{"name": "contains_text", "args": ["done"]}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Instruction given to the agent
    pub prompt: String,

    /// Target to provision
    #[serde(rename = "target")]
    pub target_ref: TargetRef,

    /// Calls run in order by `reset`
    #[serde(default)]
    pub setup: Vec<FunctionCall>,

    /// Calls run by `evaluate`; their scores are averaged
    #[serde(default)]
    pub evaluate: Vec<FunctionCall>,

    /// Free-form metadata carried into traces
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Create a task with no setup, evaluation or metadata.
    pub fn new(prompt: impl Into<String>, target_ref: TargetRef) -> Self {
        Self {
            prompt: prompt.into(),
            target_ref,
            setup: Vec::new(),
            evaluate: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a setup call.
    pub fn with_setup(mut self, call: FunctionCall) -> Self {
        self.setup.push(call);
        self
    }

    /// Append an evaluate call.
    pub fn with_evaluate(mut self, call: FunctionCall) -> Self {
        self.evaluate.push(call);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Load a task, or a list of tasks, from a JSON file.
    pub fn load_all(path: &Path) -> std::io::Result<Vec<Task>> {
        let body = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        let tasks = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_task() {
        let task: Task = serde_json::from_value(json!({
            "prompt": "check the page",
            "target": {"standard_gym": "browser"},
            "setup": [{"name": "noop"}],
            "evaluate": [{"name": "contains_text", "args": ["ok"]}],
            "metadata": {"difficulty": "easy"}
        }))
        .unwrap();

        assert_eq!(task.target_ref, TargetRef::gym("browser"));
        assert_eq!(task.setup, vec![FunctionCall::new("noop")]);
        assert_eq!(task.evaluate[0].args, vec![json!("ok")]);
        assert_eq!(task.metadata["difficulty"], "easy");
    }

    #[test]
    fn test_target_forms() {
        let remote: Task = serde_json::from_value(json!({
            "prompt": "",
            "target": {"custom_gym": {"location": "remote", "source": {"image": "acme/todo:1"}}}
        }))
        .unwrap();
        assert_eq!(remote.target_ref, TargetRef::remote_image("acme/todo:1"));

        let build: Task = serde_json::from_value(json!({
            "prompt": "",
            "target": {"custom_gym": {"location": "local", "source": {"build_context": "/gyms/todo"}}}
        }))
        .unwrap();
        assert_eq!(build.target_ref, TargetRef::local_build("/gyms/todo"));
    }

    #[test]
    fn test_unknown_target_form_rejected() {
        let result: std::result::Result<Task, _> = serde_json::from_value(json!({
            "prompt": "",
            "target": {"gym": "browser"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_matches_parse() {
        let task = Task::new("p", TargetRef::local_image("acme/todo:1"))
            .with_evaluate(FunctionCall::new("contains_text").arg("ok"));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(
            value["target"],
            json!({"custom_gym": {"location": "local", "source": {"image": "acme/todo:1"}}})
        );
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_load_all_accepts_single_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let single = dir.path().join("one.json");
        std::fs::write(&single, r#"{"prompt": "a", "target": {"standard_gym": "desktop"}}"#).unwrap();
        assert_eq!(Task::load_all(&single).unwrap().len(), 1);

        let list = dir.path().join("many.json");
        std::fs::write(
            &list,
            r#"[{"prompt": "a", "target": {"standard_gym": "desktop"}}, {"prompt": "b", "target": {"standard_gym": "browser"}}]"#,
        )
        .unwrap();
        assert_eq!(Task::load_all(&list).unwrap()[1].prompt, "b");
    }
}

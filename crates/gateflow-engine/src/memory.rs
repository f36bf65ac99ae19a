use serde_json::{Map, Value};

/// Execution-scoped working memory.
///
/// Keys are strings, values are JSON, last write wins. Nodes only see the
/// keys they declare as inputs (`view`). Parallel branches work on a `fork`
/// whose writes are journaled and replayed into the parent by `absorb` at the
/// join barrier, in whatever order the caller absorbs them.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemory {
    data: Map<String, Value>,
    journal: Vec<(String, Value)>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed memory from an execution's initial context. A non-object context
    /// is stored under `input`.
    pub fn from_context(context: Value) -> Self {
        let data = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            data,
            journal: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.journal.push((key.clone(), value.clone()));
        self.data.insert(key, value);
    }

    /// Only the declared keys; missing keys are omitted.
    pub fn view(&self, keys: &[String]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// The key a completed node's whole output is stored under.
    pub fn result_key(node_id: &str) -> String {
        format!("node_{}_result", node_id)
    }

    /// Work out which writes an agent output produces for `output_keys`.
    ///
    /// An object output that carries any of the keys contributes those fields
    /// by name; any other output is stored whole under each key.
    pub fn extract_writes(output_keys: &[String], output: &Value) -> Vec<(String, Value)> {
        if output_keys.is_empty() {
            return Vec::new();
        }
        if let Some(obj) = output.as_object() {
            if output_keys.iter().any(|k| obj.contains_key(k)) {
                return output_keys
                    .iter()
                    .filter_map(|k| obj.get(k).map(|v| (k.clone(), v.clone())))
                    .collect();
            }
        }
        output_keys
            .iter()
            .map(|k| (k.clone(), output.clone()))
            .collect()
    }

    /// A snapshot for a parallel branch, with an empty journal.
    pub fn fork(&self) -> Self {
        Self {
            data: self.data.clone(),
            journal: Vec::new(),
        }
    }

    /// Replay a branch's writes into this memory; returns the applied writes.
    pub fn absorb(&mut self, branch: WorkingMemory) -> Vec<(String, Value)> {
        for (key, value) in &branch.journal {
            self.set(key.clone(), value.clone());
        }
        branch.journal
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(k: &[&str]) -> Vec<String> {
        k.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_view_is_limited_to_declared_keys() {
        let mem = WorkingMemory::from_context(json!({"a": 1, "b": 2, "secret": 3}));
        let view = mem.view(&keys(&["a", "b", "missing"]));
        assert_eq!(view.len(), 2);
        assert!(!view.contains_key("secret"));
        assert_eq!(mem.data().len(), 3);
    }

    #[test]
    fn test_extract_object_fields() {
        let out = json!({"summary": "ok", "score": 9, "extra": true});
        let writes = WorkingMemory::extract_writes(&keys(&["summary", "score"]), &out);
        assert_eq!(
            writes,
            vec![("summary".into(), json!("ok")), ("score".into(), json!(9))]
        );
    }

    #[test]
    fn test_extract_whole_output() {
        let writes = WorkingMemory::extract_writes(&keys(&["draft"]), &json!("plain text"));
        assert_eq!(writes, vec![("draft".into(), json!("plain text"))]);

        let obj = json!({"unrelated": 1});
        let writes = WorkingMemory::extract_writes(&keys(&["draft"]), &obj);
        assert_eq!(writes, vec![("draft".into(), obj)]);

        assert!(WorkingMemory::extract_writes(&[], &json!(1)).is_empty());
    }

    #[test]
    fn test_fork_and_absorb_in_declared_order() {
        let mut parent = WorkingMemory::from_context(json!({"x": 0}));
        let mut first = parent.fork();
        let mut second = parent.fork();
        first.set("x", json!(1));
        first.set("only_first", json!(true));
        second.set("x", json!(2));
        // the branch never sees its sibling's writes
        assert!(second.get("only_first").is_none());

        parent.absorb(first);
        let applied = parent.absorb(second);
        assert_eq!(applied, vec![("x".into(), json!(2))]);
        assert_eq!(parent.get("x"), Some(&json!(2)));
        assert_eq!(parent.get("only_first"), Some(&json!(true)));
    }

    #[test]
    fn test_non_object_context() {
        let mem = WorkingMemory::from_context(json!([1, 2]));
        assert_eq!(mem.get("input"), Some(&json!([1, 2])));
        assert!(WorkingMemory::from_context(Value::Null).data().is_empty());
    }
}

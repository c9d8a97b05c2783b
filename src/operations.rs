//! Operation trait and registry
//!
//! Backs the `execute` action kind: an agent names an operation and the
//! registry resolves it. Unknown names fail without retry.

use crate::context::lookup;
use crate::error::EngineError;
use crate::services::FinancialApiClient;
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A named operation an agent may execute
#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn run(&self, parameters: &Value, context: &Value) -> Result<Value>;
}

/// Registry for looking up operations by name
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        self.operations
            .insert(operation.name().to_string(), operation);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOperation(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies selected context fields into the action result.
/// Parameters: `{"fields": ["transaction.amount", ...]}`.
pub struct SnapshotContextOperation;

#[async_trait::async_trait]
impl Operation for SnapshotContextOperation {
    fn name(&self) -> &str {
        "snapshot_context"
    }

    fn description(&self) -> &str {
        "Record selected context fields in the execution audit"
    }

    async fn run(&self, parameters: &Value, context: &Value) -> Result<Value> {
        let fields = parameters
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                EngineError::InvalidAction("snapshot_context expects 'fields' array".to_string())
            })?;

        let mut snapshot = Map::new();
        for field in fields.iter().filter_map(Value::as_str) {
            snapshot.insert(
                field.to_string(),
                lookup(context, field).cloned().unwrap_or(Value::Null),
            );
        }

        Ok(json!({ "snapshot": snapshot }))
    }
}

/// Delegates to `POST /api/v1/operations/{name}` on the financial API.
pub struct HttpOperation {
    name: String,
    api: FinancialApiClient,
}

impl HttpOperation {
    pub fn new(name: &str, api: FinancialApiClient) -> Self {
        Self {
            name: name.to_string(),
            api,
        }
    }
}

#[async_trait::async_trait]
impl Operation for HttpOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Remote operation on the financial API"
    }

    async fn run(&self, parameters: &Value, context: &Value) -> Result<Value> {
        let path = format!("/api/v1/operations/{}", self.name);
        self.api
            .post_json(
                &path,
                &json!({
                    "parameters": parameters,
                    "context": context,
                }),
            )
            .await
    }
}

/// Built-in operations plus one HTTP operation per configured name.
pub fn create_default_registry(
    api: Option<&FinancialApiClient>,
    remote_operations: &[String],
) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register(Arc::new(SnapshotContextOperation));

    if let Some(api) = api {
        for name in remote_operations {
            registry.register(Arc::new(HttpOperation::new(name, api.clone())));
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_operation() {
        let registry = create_default_registry(None, &["rebalance".to_string()]);
        assert_eq!(registry.list(), vec!["snapshot_context"]);

        let op = registry.get("snapshot_context").unwrap();
        let result = op
            .run(
                &json!({"fields": ["transaction.amount", "missing"]}),
                &json!({"transaction": {"amount": 10}}),
            )
            .await
            .unwrap();
        assert_eq!(result["snapshot"]["transaction.amount"], json!(10));
        assert_eq!(result["snapshot"]["missing"], Value::Null);
    }

    #[test]
    fn test_unknown_operation() {
        let registry = OperationRegistry::new();
        assert!(matches!(
            registry.get("wire_everything"),
            Err(EngineError::UnknownOperation(_))
        ));
    }
}

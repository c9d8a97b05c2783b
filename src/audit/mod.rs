//! Audit sealing for execution records
//!
//! Every execution is sealed with a SHA-256 digest before it is stored, so
//! a record read back later can be checked for tampering.

use crate::models::Execution;
use crate::state::AgentStore;
use crate::Result;
use sha2::{Digest, Sha256};
use std::io::Write;
use uuid::Uuid;

/// Digest of the record with its `digest` field blank.
/// Streams JSON directly into the hasher.
pub fn compute_digest(execution: &Execution) -> String {
    let mut unsealed = execution.clone();
    unsealed.digest.clear();

    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &unsealed).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

pub fn seal(execution: &mut Execution) {
    execution.digest = compute_digest(execution);
}

pub fn verify(execution: &Execution) -> bool {
    !execution.digest.is_empty() && compute_digest(execution) == execution.digest
}

/// Load an execution and check its seal. `None` when it does not exist.
pub async fn verify_stored(store: &dyn AgentStore, execution_id: Uuid) -> Result<Option<bool>> {
    Ok(store
        .get_execution(execution_id)
        .await?
        .map(|execution| verify(&execution)))
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, TriggerProvenance, TriggerType};
    use crate::state::InMemoryAgentStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn execution() -> Execution {
        Execution {
            execution_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            trigger: TriggerProvenance {
                trigger_type: TriggerType::Manual,
                trigger_id: None,
                fired_at: Utc::now(),
                payload: json!({"transaction": {"amount": 10000}}),
            },
            conditions_evaluated: vec![],
            conditions_met: true,
            actions_executed: vec![],
            status: ExecutionStatus::Success,
            execution_time_ms: 12,
            impact: Decimal::from(1000),
            oracle_transcript: vec![],
            configuration_error: None,
            created_at: Utc::now(),
            digest: String::new(),
        }
    }

    #[test]
    fn test_seal_and_detect_tampering() {
        let mut record = execution();
        assert!(!verify(&record));

        seal(&mut record);
        assert_eq!(record.digest.len(), 64);
        assert!(verify(&record));

        record.impact = Decimal::from(999_999);
        assert!(!verify(&record));
    }

    #[tokio::test]
    async fn test_verify_stored() {
        let store = InMemoryAgentStore::new();
        let mut record = execution();
        seal(&mut record);
        store.append_execution(&record).await.unwrap();

        assert_eq!(
            verify_stored(&store, record.execution_id).await.unwrap(),
            Some(true)
        );
        assert_eq!(verify_stored(&store, Uuid::new_v4()).await.unwrap(), None);
    }
}

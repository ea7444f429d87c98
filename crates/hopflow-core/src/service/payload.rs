//! Operator payload corrections with an undo history.
//!
//! Edits are allowed only while an execution is stopped (failed, paused, or
//! awaiting retry). Each edit appends a `PayloadChange` to the execution's
//! pending history; the next resume moves that history into the new
//! attempt, and `restore_payload` reverts it.

use std::sync::Arc;

use chrono::Utc;
use hopflow_types::execution::{PayloadChange, WorkflowExecution};

use crate::repository::execution::ExecutionRepository;

use super::path::{NestedPathResolver, PathError, PathResolver, ancestor_paths};
use super::{CommandError, is_editable};

pub struct PayloadService<R> {
    repository: Arc<R>,
    resolver: Arc<dyn PathResolver>,
}

impl<R: ExecutionRepository> PayloadService<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            resolver: Arc::new(NestedPathResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    async fn load_editable(
        &self,
        execution_id: &str,
        operation: &'static str,
    ) -> Result<WorkflowExecution, CommandError> {
        let execution = self
            .repository
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| CommandError::NotFound(execution_id.to_string()))?;
        if !is_editable(execution.status) {
            return Err(CommandError::invalid_status(execution_id, operation, execution.status));
        }
        Ok(execution)
    }

    /// Shallowest ancestor of `field_path` missing from `payload`, which a
    /// write to `field_path` would create.
    fn missing_ancestor(
        &self,
        payload: &serde_json::Value,
        field_path: &str,
    ) -> Result<Option<String>, PathError> {
        for ancestor in ancestor_paths(field_path) {
            if self.resolver.get(payload, ancestor)?.is_none() {
                return Ok(Some(ancestor.to_string()));
            }
        }
        Ok(None)
    }

    fn not_a_map(execution_id: &str, operation: &'static str) -> CommandError {
        CommandError::InvalidState {
            execution_id: execution_id.to_string(),
            operation,
            reason: "payload must be a map".to_string(),
        }
    }

    pub async fn update_payload_field(
        &self,
        execution_id: &str,
        field_path: &str,
        new_value: serde_json::Value,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<WorkflowExecution, CommandError> {
        const OP: &str = "update payload of";
        let mut execution = self.load_editable(execution_id, OP).await?;
        let Some(payload) = execution.payload.as_mut().filter(|p| p.is_object()) else {
            return Err(Self::not_a_map(execution_id, OP));
        };

        let old_value = self.resolver.get(payload, field_path)?;
        let created_path = match old_value {
            Some(_) => None,
            None => self.missing_ancestor(payload, field_path)?,
        };
        self.resolver.set(payload, field_path, new_value.clone())?;

        let now = Utc::now();
        execution.payload_history.push(PayloadChange {
            field_path: field_path.to_string(),
            old_value,
            new_value,
            created_path,
            changed_at: now,
            changed_by: changed_by.to_string(),
            reason,
        });
        execution.updated_at = now;

        let stored = self
            .repository
            .save(&execution)
            .await
            .map_err(|e| CommandError::from_save(execution_id, e))?;
        tracing::info!(%execution_id, %field_path, %changed_by, "updated payload field");
        Ok(stored)
    }

    /// Revert every pending change, newest first. With no pending changes
    /// the execution is returned as stored and nothing is written.
    pub async fn restore_payload(&self, execution_id: &str) -> Result<WorkflowExecution, CommandError> {
        const OP: &str = "restore payload of";
        let mut execution = self.load_editable(execution_id, OP).await?;
        if execution.payload_history.is_empty() {
            return Ok(execution);
        }

        let changes = std::mem::take(&mut execution.payload_history);
        let Some(payload) = execution.payload.as_mut().filter(|p| p.is_object()) else {
            return Err(Self::not_a_map(execution_id, OP));
        };
        for change in changes.iter().rev() {
            match &change.old_value {
                Some(old) => {
                    self.resolver.set(payload, &change.field_path, old.clone())?;
                }
                None => {
                    let added = change.created_path.as_deref().unwrap_or(&change.field_path);
                    self.resolver.remove(payload, added)?;
                }
            }
        }
        execution.updated_at = Utc::now();

        let stored = self
            .repository
            .save(&execution)
            .await
            .map_err(|e| CommandError::from_save(execution_id, e))?;
        tracing::info!(%execution_id, reverted = changes.len(), "restored payload");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use hopflow_types::message::WorkflowMessage;
    use hopflow_types::status::WorkflowStatus;
    use serde_json::json;

    fn setup(status: WorkflowStatus, payload: serde_json::Value) -> (PayloadService<MemoryStore>, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::default());
        let msg = WorkflowMessage::new("orders", 2).with_payload(payload);
        let mut exec = WorkflowExecution::from_message(&msg);
        exec.status = status;
        let exec = store.put(exec);
        (PayloadService::new(Arc::clone(&store)), store, exec.execution_id)
    }

    #[tokio::test]
    async fn test_update_records_change_and_keeps_key_order() {
        let (service, _store, id) = setup(
            WorkflowStatus::Failed,
            json!({"customer": {"email": "bad@", "name": "Ada"}, "total": 10}),
        );
        let exec = service
            .update_payload_field(&id, "customer.email", json!("ada@example.com"), "ops", Some("typo".into()))
            .await
            .unwrap();

        let payload = exec.payload.unwrap();
        assert_eq!(payload["customer"]["email"], json!("ada@example.com"));
        let keys: Vec<_> = payload.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["customer", "total"]);

        assert_eq!(exec.payload_history.len(), 1);
        let change = &exec.payload_history[0];
        assert_eq!(change.field_path, "customer.email");
        assert_eq!(change.old_value, Some(json!("bad@")));
        assert_eq!(change.new_value, json!("ada@example.com"));
        assert_eq!(change.changed_by, "ops");
        assert_eq!(change.reason.as_deref(), Some("typo"));
    }

    #[tokio::test]
    async fn test_update_rejected_while_running() {
        let (service, store, id) = setup(WorkflowStatus::InProgress, json!({"a": 1}));
        let err = service
            .update_payload_field(&id, "a", json!(2), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidState { .. }));
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn test_update_requires_map_payload() {
        let (service, _store, id) = setup(WorkflowStatus::Paused, json!([1, 2, 3]));
        let err = service
            .update_payload_field(&id, "a", json!(2), "ops", None)
            .await
            .unwrap_err();
        let CommandError::InvalidState { reason, .. } = err else {
            panic!("expected InvalidState");
        };
        assert_eq!(reason, "payload must be a map");
    }

    #[tokio::test]
    async fn test_update_conflict() {
        let (service, store, id) = setup(WorkflowStatus::Failed, json!({"a": 1}));
        store.inject_conflicts(1);
        let err = service
            .update_payload_field(&id, "a", json!(2), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_restore_reverts_in_reverse_order() {
        let (service, store, id) = setup(
            WorkflowStatus::RetryPending,
            json!({"a": 1, "items": [{"qty": 1}]}),
        );
        service.update_payload_field(&id, "a", json!(2), "ops", None).await.unwrap();
        service.update_payload_field(&id, "a", json!(3), "ops", None).await.unwrap();
        service.update_payload_field(&id, "items[0].qty", json!(9), "ops", None).await.unwrap();
        service.update_payload_field(&id, "note", json!("added"), "ops", None).await.unwrap();

        let restored = service.restore_payload(&id).await.unwrap();
        assert_eq!(restored.payload, Some(json!({"a": 1, "items": [{"qty": 1}]})));
        assert!(restored.payload_history.is_empty());
        assert_eq!(store.get(&id).unwrap().payload_history.len(), 0);
    }

    #[tokio::test]
    async fn test_restore_removes_created_parents() {
        let (service, _store, id) = setup(WorkflowStatus::Failed, json!({"a": {}, "total": 1}));
        let exec = service
            .update_payload_field(&id, "shipping.address.city", json!("Paris"), "ops", None)
            .await
            .unwrap();
        assert_eq!(exec.payload_history[0].created_path.as_deref(), Some("shipping"));
        service.update_payload_field(&id, "shipping.zip", json!("75001"), "ops", None).await.unwrap();
        let exec = service.update_payload_field(&id, "a.b", json!(1), "ops", None).await.unwrap();
        assert_eq!(exec.payload_history[2].created_path, None);

        let restored = service.restore_payload(&id).await.unwrap();
        // `a` existed before the edits, so it stays even though it is empty again.
        assert_eq!(restored.payload, Some(json!({"a": {}, "total": 1})));
    }

    #[tokio::test]
    async fn test_restore_without_history_is_a_noop() {
        let (service, store, id) = setup(WorkflowStatus::Failed, json!({"a": 1}));
        let before = store.get(&id).unwrap();
        let exec = service.restore_payload(&id).await.unwrap();
        assert_eq!(exec, before);
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn test_invalid_path_is_reported() {
        let (service, _store, id) = setup(WorkflowStatus::Failed, json!({"a": 1}));
        let err = service
            .update_payload_field(&id, "a[", json!(2), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Path(_)));
    }
}

//! Concurrent registry of workflow definitions keyed by topic.

use std::sync::Arc;

use dashmap::DashMap;

use super::definition::WorkflowDefinition;

#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Replacing an existing topic is allowed but
    /// logged; the previous definition is returned.
    pub fn register(&self, definition: WorkflowDefinition) -> Option<Arc<WorkflowDefinition>> {
        let topic = definition.topic.clone();
        let steps = definition.total_steps();
        let previous = self.definitions.insert(topic.clone(), Arc::new(definition));
        match &previous {
            Some(_) => tracing::warn!(%topic, steps, "workflow definition replaced"),
            None => tracing::info!(%topic, steps, "workflow registered"),
        }
        previous
    }

    pub fn get(&self, topic: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(topic).map(|d| Arc::clone(&d))
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.definitions.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

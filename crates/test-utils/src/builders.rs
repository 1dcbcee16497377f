#![allow(dead_code)]

use std::collections::BTreeMap;

use serde_json::{json, Value};
use wesflow::execution::{NewExecution, WorkflowMetadata};

/// Builder for `NewExecution` to simplify test setup.
pub struct NewExecutionBuilder {
    new: NewExecution,
}

impl NewExecutionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            new: NewExecution {
                name: name.to_string(),
                owner: "tester".to_string(),
                samples: Vec::new(),
                workflow: WorkflowMetadata {
                    name: "phac-nml/iridanextexample".to_string(),
                    version: "1.0.2".to_string(),
                    url: "https://github.com/phac-nml/iridanextexample".to_string(),
                    workflow_type: "NFL".to_string(),
                    workflow_type_version: "DSL2".to_string(),
                    engine: Some("nextflow".to_string()),
                    engine_version: None,
                },
                workflow_params: json!({"input": "samplesheet.csv"}),
                engine_params: Value::Null,
                tags: BTreeMap::new(),
            },
        }
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.new.owner = owner.to_string();
        self
    }

    pub fn sample(mut self, id: &str) -> Self {
        self.new.samples.push(id.to_string());
        self
    }

    pub fn workflow_url(mut self, url: &str) -> Self {
        self.new.workflow.url = url.to_string();
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        if !self.new.workflow_params.is_object() {
            self.new.workflow_params = json!({});
        }
        if let Some(map) = self.new.workflow_params.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.new.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> NewExecution {
        self.new
    }
}

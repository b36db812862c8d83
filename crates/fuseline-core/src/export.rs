//! Workflow schema exporters

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::policy::PolicySpec;
use crate::schema::{StepSchema, WorkflowSchema};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Interface for serializing workflow schemas.
pub trait Exporter {
    fn export(&self, schema: &WorkflowSchema, path: &Path) -> Result<(), ExportError>;
}

#[derive(Serialize)]
struct YamlDocument<'a> {
    steps: &'a BTreeMap<String, StepSchema>,
    outputs: &'a [String],
    policies: &'a [PolicySpec],
}

/// Serializes a schema to a shallow YAML mapping with `steps`, `outputs`
/// and `policies` sections.
#[derive(Debug, Default)]
pub struct YamlExporter;

impl YamlExporter {
    pub fn new() -> Self {
        Self
    }

    /// Render the YAML document without touching the filesystem.
    pub fn render(&self, schema: &WorkflowSchema) -> Result<String, ExportError> {
        let document = YamlDocument {
            steps: &schema.steps,
            outputs: &schema.outputs,
            policies: &schema.policies,
        };
        Ok(serde_yaml::to_string(&document)?)
    }
}

impl Exporter for YamlExporter {
    fn export(&self, schema: &WorkflowSchema, path: &Path) -> Result<(), ExportError> {
        let rendered = self.render(schema)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

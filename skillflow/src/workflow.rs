//! Workflow and stage definitions.
//!
//! A [`WorkflowDefinition`] is produced by an external loader (YAML
//! parsing and schema validation live outside this crate) and is
//! read-only for the engine's lifetime. The builder setters here exist
//! for programmatic construction in tests and embedding callers.

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One unit of work in the workflow DAG.
///
/// A stage either carries a prompt template or references a nested
/// sub-workflow, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Unique stage name within the workflow.
    pub name: String,
    /// Prompt template with `{name}`-style placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Nested sub-workflow executed in place of a model call.
    #[serde(
        default,
        alias = "sub_pipeline",
        skip_serializing_if = "Option::is_none"
    )]
    pub sub_workflow: Option<Box<WorkflowDefinition>>,
    /// Names of upstream stages whose outputs this stage consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Model override for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Output token cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tool-group references for this stage.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Hint for the expected output format (e.g. "markdown", "json").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Agent type marker; "verify" designates a verification stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

impl StageDef {
    /// Creates a prompt-driven stage.
    #[must_use]
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: Some(prompt.into()),
            sub_workflow: None,
            depends_on: Vec::new(),
            model: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            output_format: None,
            agent_type: None,
        }
    }

    /// Creates a stage that runs a nested sub-workflow.
    #[must_use]
    pub fn sub_workflow(name: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        Self {
            name: name.into(),
            prompt: None,
            sub_workflow: Some(Box::new(workflow)),
            depends_on: Vec::new(),
            model: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            output_format: None,
            agent_type: None,
        }
    }

    /// Adds an upstream dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Sets the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the temperature override.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the output token cap.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Adds a tool-group reference.
    #[must_use]
    pub fn with_tool(mut self, group: impl Into<String>) -> Self {
        self.tools.push(group.into());
        self
    }

    /// Sets the agent type marker.
    #[must_use]
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Returns true if this stage triggers the claim verification pass.
    ///
    /// A stage is a verify stage when its `agent_type` is "verify" or
    /// its name contains "verify".
    #[must_use]
    pub fn is_verify(&self) -> bool {
        self.agent_type.as_deref() == Some("verify") || self.name.contains("verify")
    }
}

/// Designates which stage's output is the workflow's primary result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Name of the stage whose output is the primary result.
    pub primary: String,
}

/// A validated, immutable workflow specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// The workflow name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The stages, in declaration order.
    pub stages: Vec<StageDef>,
    /// Tool groups that must be available for the run to start.
    #[serde(default)]
    pub tools_required: Vec<String>,
    /// Tool groups that are used when available.
    #[serde(default)]
    pub tools_optional: Vec<String>,
    /// Primary output designation.
    pub output: OutputSpec,
}

impl WorkflowDefinition {
    /// Creates an empty workflow. The primary output defaults to the
    /// last stage added.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            stages: Vec::new(),
            tools_required: Vec::new(),
            tools_optional: Vec::new(),
            output: OutputSpec {
                primary: String::new(),
            },
        }
    }

    /// Adds a stage and points the primary output at it.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDef) -> Self {
        self.output.primary = stage.name.clone();
        self.stages.push(stage);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks a tool group as required.
    #[must_use]
    pub fn with_required_tool(mut self, group: impl Into<String>) -> Self {
        self.tools_required.push(group.into());
        self
    }

    /// Marks a tool group as optional.
    #[must_use]
    pub fn with_optional_tool(mut self, group: impl Into<String>) -> Self {
        self.tools_optional.push(group.into());
        self
    }

    /// Sets the primary output stage explicitly.
    #[must_use]
    pub fn with_primary_output(mut self, stage: impl Into<String>) -> Self {
        self.output.primary = stage.into();
        self
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Validates structural invariants the engine relies on.
    ///
    /// The external loader guarantees these before the engine ever sees
    /// a definition; the engine re-checks them defensively because
    /// programmatic construction bypasses the loader.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] on duplicate stage names,
    /// unknown dependency targets, an unresolved primary output, a
    /// stage with both or neither of prompt/sub-workflow, or a stage
    /// tool reference not declared in the workflow tool lists.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stages.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' has no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.prompt.is_some() == stage.sub_workflow.is_some() {
                return Err(EngineError::Validation(format!(
                    "stage '{}' must have exactly one of prompt or sub_workflow",
                    stage.name
                )));
            }
        }

        for stage in &self.stages {
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
            }
        }

        if !seen.contains(self.output.primary.as_str()) {
            return Err(EngineError::Validation(format!(
                "primary output '{}' does not reference a declared stage",
                self.output.primary
            )));
        }

        // Stage tool refs must be declared when the workflow lists any.
        if !self.tools_required.is_empty() || !self.tools_optional.is_empty() {
            for stage in &self.stages {
                for group in &stage.tools {
                    if !self.tools_required.contains(group) && !self.tools_optional.contains(group)
                    {
                        return Err(EngineError::Validation(format!(
                            "stage '{}' references undeclared tool group '{}'",
                            stage.name, group
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

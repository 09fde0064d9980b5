//! Typed prompt templates and the stores that serve them
//!
//! A template has four named sections (instruction, rules, labeled examples,
//! status labels). Unknown keys are rejected at load time instead of being
//! rendered blindly into the prompt.

use super::catalog::StatusCatalog;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Placeholders replaced by the status-label list when found in the instruction
const STATUS_PLACEHOLDERS: [&str; 2] = ["<<status_labels>>", "<<scan_groups>>"];

/// Template lookup errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Failed to read template {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid template pattern: {0}")]
    Pattern(String),
}

/// One labeled input/output pair shown to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabeledExample {
    pub input: String,
    pub output: String,
}

/// Prompt template with named sections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptTemplate {
    /// Main instruction; a list of lines is joined with newlines
    #[serde(deserialize_with = "deserialize_text_block")]
    pub instruction: String,

    #[serde(default)]
    pub rules: Vec<String>,

    #[serde(default)]
    pub examples: Vec<LabeledExample>,

    /// Overrides the shared status catalog when non-empty
    #[serde(default)]
    pub valid_status_labels: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextBlock {
    Line(String),
    Lines(Vec<String>),
}

fn deserialize_text_block<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match TextBlock::deserialize(deserializer)? {
        TextBlock::Line(line) => line,
        TextBlock::Lines(lines) => lines.join("\n"),
    })
}

impl PromptTemplate {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            rules: Vec::new(),
            examples: Vec::new(),
            valid_status_labels: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.examples.push(LabeledExample {
            input: input.into(),
            output: output.into(),
        });
        self
    }

    pub fn with_status_labels(mut self, labels: Vec<String>) -> Self {
        self.valid_status_labels = labels;
        self
    }

    /// Parse and validate a template from JSON
    pub fn from_json(id: &str, json: &str) -> Result<Self, TemplateError> {
        let template: Self = serde_json::from_str(json).map_err(|e| TemplateError::Malformed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        template.validate(id)?;
        Ok(template)
    }

    pub fn validate(&self, id: &str) -> Result<(), TemplateError> {
        if self.instruction.trim().is_empty() {
            return Err(TemplateError::Malformed {
                id: id.to_string(),
                reason: "instruction is empty".to_string(),
            });
        }
        if let Some(example) = self
            .examples
            .iter()
            .find(|e| e.input.trim().is_empty() || e.output.trim().is_empty())
        {
            return Err(TemplateError::Malformed {
                id: id.to_string(),
                reason: format!("example has an empty side: {:?}", example),
            });
        }
        Ok(())
    }

    /// Render the system message.
    ///
    /// Sections appear in a fixed order; empty sections are omitted. Status
    /// labels come from the template when it declares any, else from `catalog`.
    pub fn render_system(&self, catalog: &StatusCatalog) -> String {
        let labels: Vec<&str> = if self.valid_status_labels.is_empty() {
            catalog.labels().iter().map(String::as_str).collect()
        } else {
            self.valid_status_labels.iter().map(String::as_str).collect()
        };
        let label_list = bullet_list(&labels);

        let mut instruction = self.instruction.trim().to_string();
        let mut labels_inlined = false;
        for placeholder in STATUS_PLACEHOLDERS {
            if instruction.contains(placeholder) {
                instruction = instruction.replace(placeholder, &label_list);
                labels_inlined = true;
            }
        }

        let mut sections = vec![section("Instruction", &instruction)];

        if !self.rules.is_empty() {
            let rules: Vec<&str> = self.rules.iter().map(String::as_str).collect();
            sections.push(section("Rules", &bullet_list(&rules)));
        }

        if !self.examples.is_empty() {
            let examples = self
                .examples
                .iter()
                .map(|e| format!("Input: {}\nOutput: {}", e.input.trim(), e.output.trim()))
                .collect::<Vec<_>>()
                .join("\n\n");
            sections.push(section("Examples", &examples));
        }

        if !labels_inlined && !labels.is_empty() {
            sections.push(section("Valid Status Labels", &label_list));
        }

        sections.join("\n\n")
    }
}

fn section(title: &str, body: &str) -> String {
    format!("**{}**:\n{}", title, body)
}

fn bullet_list(items: &[&str]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source of prompt templates keyed by id
pub trait TemplateStore: Send + Sync {
    fn load(&self, id: &str) -> Result<PromptTemplate, TemplateError>;

    /// Ids of all available templates, sorted
    fn list(&self) -> Result<Vec<String>, TemplateError>;
}

/// Templates stored as `<dir>/<id>.json`
pub struct FileTemplateStore {
    dir: PathBuf,
}

impl FileTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, TemplateError> {
        if id.is_empty() || id.contains(|c| c == '/' || c == '\\') || id.contains("..") {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        let file = if id.ends_with(".json") {
            id.to_string()
        } else {
            format!("{}.json", id)
        };
        Ok(self.dir.join(file))
    }
}

impl TemplateStore for FileTemplateStore {
    fn load(&self, id: &str) -> Result<PromptTemplate, TemplateError> {
        let path = self.path_for(id)?;
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(id.to_string()));
            }
            Err(source) => {
                return Err(TemplateError::Io {
                    id: id.to_string(),
                    source,
                });
            }
        };

        debug!(template = id, path = %path.display(), "Loaded prompt template");
        PromptTemplate::from_json(id, &json)
    }

    fn list(&self) -> Result<Vec<String>, TemplateError> {
        let pattern = self.dir.join("*.json");
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern).map_err(|e| TemplateError::Pattern(e.to_string()))?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Templates held in memory, for embedding and tests
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: HashMap<String, PromptTemplate>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, id: impl Into<String>, template: PromptTemplate) -> Self {
        self.insert(id, template);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, template: PromptTemplate) {
        self.templates.insert(id.into(), template);
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn load(&self, id: &str) -> Result<PromptTemplate, TemplateError> {
        let template = self
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))?;
        template.validate(id)?;
        Ok(template)
    }

    fn list(&self) -> Result<Vec<String>, TemplateError> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

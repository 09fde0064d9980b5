//! Ordered catalog of valid status labels

use crate::error::{PipelineError, Result};
use std::path::Path;

/// Header names tolerated on the first line of a plain-text catalog
const HEADER_NAMES: [&str; 3] = ["scan_group", "status", "label"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCatalog {
    labels: Vec<String>,
}

impl StatusCatalog {
    /// Build a catalog, trimming labels and dropping blanks and duplicates
    pub fn new(labels: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.trim();
            if !label.is_empty() && !unique.iter().any(|l| l == label) {
                unique.push(label.to_string());
            }
        }
        Self { labels: unique }
    }

    /// Load from a JSON array of strings, or one label per line otherwise
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!(
                "Cannot read status catalog {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            let labels: Vec<String> = serde_json::from_str(&text).map_err(|e| {
                PipelineError::configuration(format!(
                    "Status catalog {} is not a JSON list of strings: {}",
                    path.display(),
                    e
                ))
            })?;
            return Ok(Self::new(labels));
        }

        Ok(Self::parse_lines(&text))
    }

    fn parse_lines(text: &str) -> Self {
        let labels = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .enumerate()
            .filter(|(idx, line)| {
                !(*idx == 0 && HEADER_NAMES.iter().any(|h| h.eq_ignore_ascii_case(line)))
            })
            .map(|(_, line)| line.to_string())
            .collect();
        Self::new(labels)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn contains(&self, label: &str) -> bool {
        let label = label.trim();
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

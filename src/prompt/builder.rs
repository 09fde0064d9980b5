//! Shipment scan histories and the prompt builder

use super::catalog::StatusCatalog;
use super::template::{TemplateError, TemplateStore};
use crate::context::PromptMessage;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Rendered in place of an empty scan history
pub const NO_EVENTS_MARKER: &str = "No scan events recorded.";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A timestamped free-text status update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub timestamp: Option<NaiveDateTime>,
    pub description: String,
}

impl ScanEvent {
    pub fn new(timestamp: Option<NaiveDateTime>, description: impl Into<String>) -> Self {
        Self {
            timestamp,
            description: description.into(),
        }
    }

    /// Parse one `(timestamp) description` segment.
    ///
    /// A prefix that is not a recognizable timestamp stays in the description.
    pub fn parse(segment: &str) -> Self {
        let segment = segment.trim();
        if let Some(rest) = segment.strip_prefix('(') {
            if let Some(close) = rest.find(')') {
                if let Some(timestamp) = parse_timestamp(rest[..close].trim()) {
                    return Self::new(Some(timestamp), rest[close + 1..].trim());
                }
            }
        }
        Self::new(None, segment)
    }

    pub fn render(&self) -> String {
        match self.timestamp {
            Some(ts) => format!("({}) {}", ts.format(TIMESTAMP_FORMAT), self.description),
            None => self.description.clone(),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok())
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").ok())
}

/// Split a free-text scan-history cell into events.
///
/// Events are separated by newlines or by a comma directly followed by `(`.
pub fn parse_scan_history(text: &str) -> Vec<ScanEvent> {
    text.lines()
        .flat_map(split_segments)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(ScanEvent::parse)
        .collect()
}

fn split_segments(line: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (idx, _) in line.match_indices(",(") {
        segments.push(&line[start..idx]);
        start = idx + 1;
    }
    segments.push(&line[start..]);
    segments
}

/// One shipment's tracking history, loaded once per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub identifier: Option<String>,
    pub carrier: Option<String>,
    pub events: Vec<ScanEvent>,
}

impl ShipmentRecord {
    pub fn new(identifier: Option<String>, carrier: Option<String>, events: Vec<ScanEvent>) -> Self {
        Self {
            identifier,
            carrier,
            events,
        }
    }

    /// Build from a raw table cell; a missing cell yields no events
    pub fn from_cell(identifier: Option<String>, carrier: Option<String>, cell: Option<&str>) -> Self {
        Self::new(identifier, carrier, parse_scan_history(cell.unwrap_or("")))
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Chronological rendering of the `max_events` most recent events
    pub fn render_history(&self, max_events: usize) -> String {
        if self.events.is_empty() {
            return NO_EVENTS_MARKER.to_string();
        }

        // stable: undated events sort first and keep their relative order
        let mut ordered: Vec<&ScanEvent> = self.events.iter().collect();
        ordered.sort_by_key(|event| event.timestamp);

        let start = ordered.len().saturating_sub(max_events.max(1));
        ordered[start..]
            .iter()
            .map(|event| event.render())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// System and user message for one shipment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub system: PromptMessage,
    pub user: PromptMessage,
}

impl BuiltPrompt {
    pub fn messages(&self) -> [PromptMessage; 2] {
        [self.system.clone(), self.user.clone()]
    }
}

/// Renders templates plus shipment data into chat messages
pub struct PromptBuilder {
    store: Arc<dyn TemplateStore>,
    catalog: StatusCatalog,
    max_scan_events: usize,
    rendered: Mutex<HashMap<String, Arc<str>>>,
}

impl PromptBuilder {
    pub fn new(store: Arc<dyn TemplateStore>, catalog: StatusCatalog, max_scan_events: usize) -> Self {
        Self {
            store,
            catalog,
            max_scan_events,
            rendered: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &StatusCatalog {
        &self.catalog
    }

    /// Template ids the store can serve
    pub fn available_templates(&self) -> Result<Vec<String>, TemplateError> {
        self.store.list()
    }

    /// Rendered system prompt for a template, cached after the first success
    pub fn system_prompt(&self, template_id: &str) -> Result<Arc<str>, TemplateError> {
        let mut rendered = self.rendered.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(system) = rendered.get(template_id) {
            return Ok(Arc::clone(system));
        }

        let template = self.store.load(template_id)?;
        let system: Arc<str> = Arc::from(template.render_system(&self.catalog));
        debug!(template = template_id, "Rendered system prompt");
        rendered.insert(template_id.to_string(), Arc::clone(&system));
        Ok(system)
    }

    /// User message for one shipment; never empty
    pub fn user_message(&self, record: &ShipmentRecord) -> String {
        let mut lines = Vec::with_capacity(4);
        if let Some(identifier) = record.identifier.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("Shipment: {}", identifier.trim()));
        }
        if let Some(carrier) = record.carrier.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("Carrier: {}", carrier.trim()));
        }
        lines.push("Scan History:".to_string());
        lines.push(record.render_history(self.max_scan_events));
        lines.join("\n")
    }

    /// Build `[system, user]` for a shipment.
    ///
    /// A template failure is returned to the caller, which records it against
    /// the row and moves on.
    pub fn build(&self, template_id: &str, record: &ShipmentRecord) -> Result<BuiltPrompt, TemplateError> {
        let system = self.system_prompt(template_id)?;
        Ok(BuiltPrompt {
            system: PromptMessage::system(&*system),
            user: PromptMessage::user(self.user_message(record)),
        })
    }
}

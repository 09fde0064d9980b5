//! Prompt construction for shipment classification

pub mod builder;
pub mod catalog;
pub mod template;

pub use builder::{parse_scan_history, BuiltPrompt, PromptBuilder, ScanEvent, ShipmentRecord, NO_EVENTS_MARKER};
pub use catalog::StatusCatalog;
pub use template::{
    FileTemplateStore, InMemoryTemplateStore, LabeledExample, PromptTemplate, TemplateError, TemplateStore,
};

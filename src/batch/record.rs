//! Prediction records and output row shaping

use crate::config::ModelPricing;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Status written for rows that could not be classified
pub const ERROR_STATUS: &str = "Error";

/// Columns appended to every output row, in order
pub const OUTPUT_COLUMNS: [&str; 6] = [
    "Input_Text",
    "Predicted_Status",
    "Token_Input",
    "Token_Output",
    "Total_Tokens",
    "Estimated_Cost",
];

/// Keys accepted when the model replies with a JSON object
const STATUS_KEYS: [&str; 3] = ["status", "predicted_status", "Predicted_Status"];

/// Outcome of classifying one input row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Position of the row in the input table
    pub row_index: usize,
    /// SHA-256 of `input_text`, used to validate resumed rows
    pub input_fingerprint: String,
    pub input_text: String,
    pub predicted_status: String,
    pub token_input: usize,
    pub token_output: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionRecord {
    pub fn success(
        row_index: usize,
        input_text: impl Into<String>,
        predicted_status: impl Into<String>,
        token_input: usize,
        token_output: usize,
    ) -> Self {
        let input_text = input_text.into();
        Self {
            row_index,
            input_fingerprint: fingerprint(&input_text),
            input_text,
            predicted_status: predicted_status.into(),
            token_input,
            token_output,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Error sentinel: `Error` status and zero tokens
    pub fn failure(row_index: usize, input_text: impl Into<String>, reason: impl Into<String>) -> Self {
        let input_text = input_text.into();
        Self {
            row_index,
            input_fingerprint: fingerprint(&input_text),
            input_text,
            predicted_status: ERROR_STATUS.to_string(),
            token_input: 0,
            token_output: 0,
            created_at: Utc::now(),
            error: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn total_tokens(&self) -> usize {
        self.token_input + self.token_output
    }

    pub fn estimated_cost(&self, pricing: Option<ModelPricing>) -> f64 {
        pricing.map_or(0.0, |pricing| pricing.cost(self.token_input, self.token_output))
    }

    /// Whether this record was produced from `input_text`
    pub fn matches_input(&self, input_text: &str) -> bool {
        self.input_fingerprint == fingerprint(input_text)
    }

    /// Output columns for this record, costed at `pricing`
    pub fn output_columns(&self, pricing: Option<ModelPricing>) -> IndexMap<String, Value> {
        let cost = self.estimated_cost(pricing);
        let values = [
            json!(self.input_text),
            json!(self.predicted_status),
            json!(self.token_input),
            json!(self.token_output),
            json!(self.total_tokens()),
            json!(cost),
        ];
        OUTPUT_COLUMNS
            .iter()
            .map(|column| column.to_string())
            .zip(values)
            .collect()
    }
}

/// Hex SHA-256 of `text`
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Reduce a model reply to a status label.
///
/// A JSON object reply carrying a status key yields that value; anything else
/// is used as-is after trimming.
pub fn extract_status(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        for key in STATUS_KEYS {
            if let Some(Value::String(status)) = object.get(key) {
                return status.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

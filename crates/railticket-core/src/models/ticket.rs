use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;

/// Result of a successful upstream login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub token: String,
    /// Seconds since the Unix epoch.
    pub expires_at: i64,
    /// Terms the upstream wants the user to accept. Surfaced, never acted on.
    #[serde(default)]
    pub documents_to_accept: Vec<PolicyDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub code: String,
    pub version: Option<i64>,
    pub html_url: Option<String>,
    pub pdf_url: Option<String>,
}

/// One displayable ticket, flattened out of the upstream order hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TicketRecord {
    /// `{order}-{document}-{line item}`
    pub id: String,
    pub order_id: String,
    pub document_id: String,
    pub line_item_id: String,
    /// `{document}_{serial}`
    pub ticket_key: String,
    pub serial_number: Option<String>,
    pub passenger_name: Option<String>,
    pub ticket_name: String,
    pub discount: Option<String>,
    pub valid_from: Option<i64>,
    pub valid_to: Option<i64>,
    pub price: Option<f64>,
    pub status: Option<String>,
}

impl TicketRecord {
    pub fn composite_id(order_id: &str, document_id: &str, line_item_id: &str) -> String {
        format!("{}-{}-{}", order_id, document_id, line_item_id)
    }

    pub fn ticket_key(document_id: &str, serial_number: Option<&str>) -> String {
        format!("{}_{}", document_id, serial_number.unwrap_or_default())
    }
}

/// Base64 ticket image for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TicketImage {
    pub document_id: String,
    pub image_base64: String,
    pub serial_number: Option<String>,
    pub document_kind: Option<String>,
}

impl TicketImage {
    pub fn decode(&self) -> Result<Vec<u8>, ApiError> {
        STANDARD.decode(self.image_base64.trim()).map_err(|e| {
            ApiError::MalformedUpstreamResponse(format!("ticket image is not valid base64: {}", e))
        })
    }

    /// File extension guessed from the decoded bytes' magic number.
    pub fn extension(bytes: &[u8]) -> &'static str {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            "png"
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            "jpg"
        } else if bytes.starts_with(b"%PDF") {
            "pdf"
        } else {
            "bin"
        }
    }
}

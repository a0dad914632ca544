//! Typed views over entity data.
//!
//! Entities travel as JSON (`serde_json::Value`) so the cache and the wire
//! format stay schema-agnostic; these types are the shape both ends agree on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a count session: expected vs. counted quantity for an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemLine {
    pub session_id: String,
    pub item_id: String,
    /// Quantity on record in the system of record
    #[serde(default)]
    pub expected_quantity: Option<i64>,
    #[serde(default)]
    pub counted_quantity: Option<i64>,
    /// `counted - expected`, once both are known
    #[serde(default)]
    pub variance: Option<i64>,
    #[serde(default)]
    pub variance_approved: bool,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approval_comment: Option<String>,
    #[serde(default)]
    pub recount_requested: bool,
    #[serde(default)]
    pub recount_reason: Option<String>,
}

impl ItemLine {
    pub fn new(session_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            item_id: item_id.into(),
            expected_quantity: None,
            counted_quantity: None,
            variance: None,
            variance_approved: false,
            approved_by: None,
            approval_comment: None,
            recount_requested: false,
            recount_reason: None,
        }
    }

    pub fn with_expected(mut self, quantity: i64) -> Self {
        self.expected_quantity = Some(quantity);
        self.refresh_variance();
        self
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Decode `value`, or start a blank line when nothing is known yet.
    pub fn from_value_or_new(
        value: &Value,
        session_id: &str,
        item_id: &str,
    ) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            Ok(Self::new(session_id, item_id))
        } else {
            Self::from_value(value)
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Record a new count. A different count invalidates an earlier
    /// approval and satisfies an outstanding recount request.
    pub fn set_count(&mut self, quantity: i64) {
        if self.counted_quantity != Some(quantity) {
            self.variance_approved = false;
            self.approved_by = None;
            self.approval_comment = None;
        }
        self.counted_quantity = Some(quantity);
        self.recount_requested = false;
        self.recount_reason = None;
        self.refresh_variance();
    }

    pub fn approve(&mut self, actor: &str, comment: Option<String>) {
        self.variance_approved = true;
        self.approved_by = Some(actor.to_string());
        self.approval_comment = comment;
    }

    pub fn request_recount(&mut self, reason: &str) {
        self.recount_requested = true;
        self.recount_reason = Some(reason.to_string());
    }

    fn refresh_variance(&mut self) {
        self.variance = match (self.counted_quantity, self.expected_quantity) {
            (Some(counted), Some(expected)) => Some(counted - expected),
            _ => None,
        };
    }
}

/// A note attached to a count session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub session_id: String,
    pub note_id: String,
    pub body: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl Note {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

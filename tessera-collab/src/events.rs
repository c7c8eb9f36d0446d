//! Business events from the surrounding application.
//!
//! Table, field, record and view changes made outside a collaborative
//! session are folded into the document of the affected table so that
//! connected editors see them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Document that collects table-level events.
pub const GLOBAL_TABLES_DOCUMENT: &str = "global:tables";

/// Root map receiving folded events.
pub const BUSINESS_EVENTS_MAP: &str = "business_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusinessEventType {
    #[serde(rename = "table.create")]
    TableCreate,
    #[serde(rename = "table.update")]
    TableUpdate,
    #[serde(rename = "table.delete")]
    TableDelete,
    #[serde(rename = "field.create")]
    FieldCreate,
    #[serde(rename = "field.update")]
    FieldUpdate,
    #[serde(rename = "field.delete")]
    FieldDelete,
    #[serde(rename = "record.create")]
    RecordCreate,
    #[serde(rename = "record.update")]
    RecordUpdate,
    #[serde(rename = "record.delete")]
    RecordDelete,
    #[serde(rename = "calculation.update")]
    CalculationUpdate,
    #[serde(rename = "view.create")]
    ViewCreate,
    #[serde(rename = "view.update")]
    ViewUpdate,
    #[serde(rename = "view.delete")]
    ViewDelete,
}

impl BusinessEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableCreate => "table.create",
            Self::TableUpdate => "table.update",
            Self::TableDelete => "table.delete",
            Self::FieldCreate => "field.create",
            Self::FieldUpdate => "field.update",
            Self::FieldDelete => "field.delete",
            Self::RecordCreate => "record.create",
            Self::RecordUpdate => "record.update",
            Self::RecordDelete => "record.delete",
            Self::CalculationUpdate => "calculation.update",
            Self::ViewCreate => "view.create",
            Self::ViewUpdate => "view.update",
            Self::ViewDelete => "view.delete",
        }
    }
}

/// A change notification from the application layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BusinessEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl BusinessEvent {
    pub fn new(kind: BusinessEventType, table_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: String::new(),
            kind,
            table_id: Some(table_id.into()),
            record_id: None,
            field_id: None,
            data,
            user_id: None,
            timestamp: 0,
            version: None,
        }
    }

    /// Document the event belongs to.
    ///
    /// Record, field and view events go to their table's document; table
    /// events go to [`GLOBAL_TABLES_DOCUMENT`]. Calculation events and
    /// events missing a table id are not routed.
    pub fn document_id(&self) -> Option<String> {
        use BusinessEventType::*;
        match self.kind {
            TableCreate | TableUpdate | TableDelete => Some(GLOBAL_TABLES_DOCUMENT.to_string()),
            RecordCreate | RecordUpdate | RecordDelete | FieldCreate | FieldUpdate | FieldDelete
            | ViewCreate | ViewUpdate | ViewDelete => {
                self.table_id.clone().filter(|t| !t.is_empty())
            }
            CalculationUpdate => None,
        }
    }

    /// Value stored in the document's event map.
    pub fn payload(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "table_id": self.table_id.clone().unwrap_or_default(),
            "record_id": self.record_id.clone().unwrap_or_default(),
            "field_id": self.field_id.clone().unwrap_or_default(),
            "data": self.data,
            "user_id": self.user_id.clone().unwrap_or_default(),
            "version": self.version.unwrap_or_default(),
            "timestamp": self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_events_route_to_table_document() {
        let event = BusinessEvent::new(BusinessEventType::RecordUpdate, "tbl_1", json!({"a": 1}));
        assert_eq!(event.document_id().as_deref(), Some("tbl_1"));
        let event = BusinessEvent::new(BusinessEventType::ViewCreate, "tbl_2", Value::Null);
        assert_eq!(event.document_id().as_deref(), Some("tbl_2"));
    }

    #[test]
    fn test_table_events_route_to_global_document() {
        let event = BusinessEvent::new(BusinessEventType::TableCreate, "tbl_1", Value::Null);
        assert_eq!(event.document_id().as_deref(), Some(GLOBAL_TABLES_DOCUMENT));
    }

    #[test]
    fn test_unrouted_events() {
        let mut event = BusinessEvent::new(BusinessEventType::FieldCreate, "", Value::Null);
        assert_eq!(event.document_id(), None);
        event.table_id = None;
        assert_eq!(event.document_id(), None);
        let calc = BusinessEvent::new(BusinessEventType::CalculationUpdate, "tbl", Value::Null);
        assert_eq!(calc.document_id(), None);
    }

    #[test]
    fn test_parse_from_json() {
        let event: BusinessEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "record.create",
            "table_id": "tbl_9",
            "record_id": "rec_1",
            "data": {"name": "Ada"},
            "timestamp": 17,
            "version": 3
        }))
        .unwrap();
        assert_eq!(event.kind, BusinessEventType::RecordCreate);
        let payload = event.payload();
        assert_eq!(payload["type"], "record.create");
        assert_eq!(payload["record_id"], "rec_1");
        assert_eq!(payload["field_id"], "");
        assert_eq!(payload["version"], 3);
        assert_eq!(payload["data"]["name"], "Ada");
    }
}

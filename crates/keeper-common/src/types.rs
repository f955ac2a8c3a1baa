//! Records and tuples shared by the ingestion pipeline stages

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{KeeperError, Result};

/// Length of every list identifier; the legacy delete framing depends on it.
pub const LIST_ID_LEN: usize = 8;

/// Field name -> value for one component, in the order the fields were seen.
pub type ComponentFields = IndexMap<String, String>;

/// List-level lookup parameters attached to every stored component.
pub type SchemaParameters = BTreeMap<String, String>;

/// Positional field values of one delimited row, tagged with its list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub list_id: String,
    pub values: Vec<String>,
}

impl RawRecord {
    pub fn new(list_id: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            list_id: list_id.into(),
            values,
        }
    }
}

/// One row ready for the append-only component store.
///
/// `tracking = false` marks a tombstone: the most recent row per component
/// decides whether it is still tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTuple {
    pub list_id: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub tracking: bool,
}

impl NormalizedTuple {
    pub fn tracked(list_id: impl Into<String>, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            list_id: list_id.into(),
            name: name.into(),
            payload,
            tracking: true,
        }
    }

    pub fn tombstone(
        list_id: impl Into<String>,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            list_id: list_id.into(),
            name: name.into(),
            payload,
            tracking: false,
        }
    }
}

/// Request to stop tracking a component.
///
/// `body` holds the JSON field map of the component being removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub list_id: String,
    pub body: Vec<u8>,
}

impl DeleteRequest {
    pub fn new(list_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            list_id: list_id.into(),
            body: body.into(),
        }
    }

    /// Parse the legacy `<JSON field map><8-char list id>` frame.
    pub fn from_legacy_frame(frame: &[u8]) -> Result<Self> {
        if frame.len() < LIST_ID_LEN {
            return Err(KeeperError::validation(format!(
                "delete frame of {} bytes is shorter than a list id",
                frame.len()
            )));
        }
        let (body, id) = frame.split_at(frame.len() - LIST_ID_LEN);
        let list_id = std::str::from_utf8(id)
            .map_err(|_| KeeperError::validation("delete frame list id is not UTF-8"))?;

        Ok(Self::new(list_id, body))
    }

    /// Encode in the legacy frame, the inverse of [`Self::from_legacy_frame`].
    pub fn to_legacy_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.body.len() + self.list_id.len());
        frame.extend_from_slice(&self.body);
        frame.extend_from_slice(self.list_id.as_bytes());
        frame
    }

    pub fn fields(&self) -> Result<ComponentFields> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

//! Availability data returned by the external stock source
//!
//! These documents are what the [`ResultCache`](crate::cache::ResultCache)
//! holds per component name.

use keeper_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::ResultCache;

/// Cache of stock responses keyed by component name.
pub type AvailabilityCache = ResultCache<StockResponse>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockResponse {
    #[serde(default)]
    pub rows: Vec<StockRow>,
    #[serde(default)]
    pub stockdata: StockData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockRow {
    #[serde(rename = "part")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "mfg", default)]
    pub manufacturer: String,
    #[serde(default)]
    pub stock: String,
    /// Price breaks as `[quantity, price]` pairs; the source mixes numbers
    /// and strings.
    #[serde(default)]
    pub price: Vec<Vec<Value>>,
}

/// Supplier details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub site: String,
    #[serde(rename = "contact_email", default)]
    pub email: String,
    #[serde(rename = "min_order", default)]
    pub min_order: String,
}

impl StockResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Rows offering `name`, compared case-insensitively.
    pub fn rows_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StockRow> + 'a {
        self.rows
            .iter()
            .filter(move |row| row.name.eq_ignore_ascii_case(name))
    }
}

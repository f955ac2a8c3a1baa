//! Delimited table decoder
//!
//! The header row decides the delimiter: `,` first, `;` when splitting on a
//! comma yields a single field. Quoted header fields may span lines. Every
//! following row becomes one [`RawRecord`] for the analyzer, in file order.

use async_trait::async_trait;
use csv_async::{AsyncReaderBuilder, StringRecord};
use keeper_common::{KeeperError, RawRecord, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DecodeSummary, PayloadFormat, RecordDecoder};
use crate::schema::SchemaSource;
use crate::storage::StagedPayload;

const DELIMITERS: [u8; 2] = [b',', b';'];

pub struct DelimitedDecoder {
    schema: Arc<dyn SchemaSource>,
    output: mpsc::Sender<RawRecord>,
}

impl DelimitedDecoder {
    pub fn new(schema: Arc<dyn SchemaSource>, output: mpsc::Sender<RawRecord>) -> Self {
        Self { schema, output }
    }
}

/// Split the header row, returning the delimiter that produced more than one
/// field.
pub fn sniff_header(line: &str) -> Result<(u8, Vec<String>)> {
    let line = line.trim_start_matches('\u{feff}').trim_end_matches(['\r', '\n']);

    for delimiter in DELIMITERS {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(delimiter)
            .from_reader(line.as_bytes());

        let mut header = csv::StringRecord::new();
        let found = reader
            .read_record(&mut header)
            .map_err(|e| KeeperError::format(format!("unreadable header row: {e}")))?;

        if found && header.len() > 1 {
            return Ok((delimiter, header.iter().map(str::to_string).collect()));
        }
    }

    Err(KeeperError::format(
        "header row does not split into fields on ',' or ';'",
    ))
}

/// Read the header row, continuing past line breaks inside quoted fields.
async fn read_header<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut header = String::new();
    loop {
        let read = reader.read_line(&mut header).await?;
        // An odd number of quotes so far means a quoted field is still open
        if read == 0 || header.matches('"').count() % 2 == 0 {
            return Ok(header);
        }
    }
}

#[async_trait]
impl RecordDecoder for DelimitedDecoder {
    fn format(&self) -> PayloadFormat {
        PayloadFormat::Delimited
    }

    async fn decode(
        &self,
        list_id: &str,
        payload: StagedPayload,
        cancel: &CancellationToken,
    ) -> Result<DecodeSummary> {
        let mut reader = BufReader::new(payload);
        let header = read_header(&mut reader).await?;
        if header.is_empty() {
            return Err(KeeperError::format("payload has no header row"));
        }

        let (delimiter, names) = sniff_header(&header)?;
        self.schema.reconcile_field_names(list_id, &names)?;
        debug!(list_id, fields = names.len(), delimiter = %(delimiter as char), "Header accepted");

        let mut rows = AsyncReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .create_reader(reader);

        let mut summary = DecodeSummary::default();
        let mut record = StringRecord::new();
        loop {
            let more = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(list_id, emitted = summary.emitted, "Delimited decode cancelled");
                    return Err(KeeperError::Cancelled);
                }
                read = rows.read_record(&mut record) => read.map_err(|e| {
                    KeeperError::format(format!("row {}: {e}", summary.emitted + 2))
                })?,
            };
            if !more {
                break;
            }

            // Rows must match the header width; a malformed row ends the payload
            if record.len() != names.len() {
                return Err(KeeperError::format(format!(
                    "row {} has {} fields, header has {}",
                    summary.emitted + 2,
                    record.len(),
                    names.len()
                )));
            }

            let values = record.iter().map(str::to_string).collect();
            self.output
                .send(RawRecord::new(list_id, values))
                .await
                .map_err(|_| KeeperError::Cancelled)?;
            summary.emitted += 1;
        }

        info!(list_id, rows = summary.emitted, "Delimited payload decoded");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use std::io::Cursor;

    fn payload(text: &str) -> StagedPayload {
        Box::new(Cursor::new(text.as_bytes().to_vec()))
    }

    fn decoder(capacity: usize) -> (DelimitedDecoder, Arc<SchemaRegistry>, mpsc::Receiver<RawRecord>) {
        let schema = Arc::new(SchemaRegistry::new());
        let (tx, rx) = mpsc::channel(capacity);
        (DelimitedDecoder::new(schema.clone(), tx), schema, rx)
    }

    #[test]
    fn test_sniff_comma_then_semicolon() {
        let (delimiter, names) = sniff_header("part name,value\r\n").unwrap();
        assert_eq!(delimiter, b',');
        assert_eq!(names, vec!["part name", "value"]);

        let (delimiter, names) = sniff_header("part name;value;qty\n").unwrap();
        assert_eq!(delimiter, b';');
        assert_eq!(names.len(), 3);

        assert!(matches!(sniff_header("part name\n"), Err(KeeperError::Format(_))));
    }

    #[tokio::test]
    async fn test_rows_emitted_in_order() {
        let (decoder, schema, mut rx) = decoder(16);
        let text = "part name,value\nR1,10k\nR2,4k7\nR3,1M\n";

        let summary = decoder
            .decode("L1abcdef", payload(text), &CancellationToken::new())
            .await
            .unwrap();
        drop(decoder);

        assert_eq!(summary.emitted, 3);
        let mut names = Vec::new();
        while let Some(record) = rx.recv().await {
            assert_eq!(record.list_id, "L1abcdef");
            names.push(record.values[0].clone());
        }
        assert_eq!(names, vec!["R1", "R2", "R3"]);
        assert_eq!(schema.field_order("L1abcdef").unwrap().0, vec!["part name", "value"]);
    }

    #[tokio::test]
    async fn test_quoted_header_spanning_lines() {
        let (decoder, schema, mut rx) = decoder(4);
        let text = "\"part\nname\",\"value \"\"ohm\"\"\"\nR1,10k\n";

        let summary = decoder
            .decode("L1abcdef", payload(text), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.emitted, 1);
        assert_eq!(
            schema.field_order("L1abcdef").unwrap().0,
            vec!["part\nname", "value \"ohm\""]
        );
        assert_eq!(rx.recv().await.unwrap().values, vec!["R1", "10k"]);
    }

    #[tokio::test]
    async fn test_semicolon_table() {
        let (decoder, _schema, mut rx) = decoder(4);
        decoder
            .decode("L1", payload("part name;value\nR1;10k\n"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().values, vec!["R1", "10k"]);
    }

    #[tokio::test]
    async fn test_single_column_header_rejected() {
        let (decoder, schema, _rx) = decoder(4);
        let err = decoder
            .decode("L1", payload("part name\nR1\n"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, KeeperError::Format(_)));
        assert!(schema.all_ids().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_row_aborts_remaining() {
        let (decoder, _schema, mut rx) = decoder(16);
        let text = "part name,value\nR1,10k\nR2\nR3,1M\n";

        let err = decoder
            .decode("L1", payload(text), &CancellationToken::new())
            .await
            .unwrap_err();
        drop(decoder);

        assert!(matches!(err, KeeperError::Format(_)));
        assert_eq!(rx.recv().await.unwrap().values[0], "R1");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_rows() {
        let (decoder, _schema, _rx) = decoder(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = decoder
            .decode("L1", payload("part name,value\nR1,10k\n"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::Cancelled));
    }
}

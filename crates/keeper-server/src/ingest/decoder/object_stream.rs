//! Object stream decoder
//!
//! Payloads are JSON arrays of flat objects. The stream is cut at every `}`
//! so objects are decoded as they arrive, without holding the whole array.
//! A `}` inside a string value therefore splits the object and the damaged
//! pieces are skipped. A run of more than [`MAX_OBJECT_LEN`] bytes without a
//! `}` fails the payload.

use async_trait::async_trait;
use keeper_common::{ComponentFields, KeeperError, NormalizedTuple, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{encode, DecodeSummary, PayloadFormat, RecordDecoder};
use crate::schema::{SchemaSource, DEFAULT_NAME_FIELD, PARAM_NAME_FIELD};
use crate::storage::StagedPayload;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Longest accepted run of bytes without a closing `}`
pub const MAX_OBJECT_LEN: usize = 1024 * 1024;

/// Splits a byte stream into `}`-terminated tokens.
struct ObjectTokenizer {
    reader: StagedPayload,
    buf: Vec<u8>,
    scanned: usize,
    eof: bool,
    max_len: usize,
}

impl ObjectTokenizer {
    fn new(reader: StagedPayload) -> Self {
        Self::with_max_len(reader, MAX_OBJECT_LEN)
    }

    fn with_max_len(reader: StagedPayload, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            scanned: 0,
            eof: false,
            max_len,
        }
    }

    async fn next_token(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'}') {
                let end = self.scanned + offset;
                self.scanned = 0;
                return Ok(Some(self.buf.drain(..=end).collect()));
            }
            self.scanned = self.buf.len();
            if self.buf.len() > self.max_len {
                return Err(KeeperError::format(format!(
                    "no closing '}}' within {} bytes",
                    self.max_len
                )));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.scanned = 0;
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Strip the array framing around one token; `None` when nothing is left.
fn object_body(token: &[u8], first: bool) -> Option<&[u8]> {
    let mut body = token;
    if first {
        if let Some(open) = body.iter().position(|&b| b == b'[') {
            body = &body[open + 1..];
        }
    }

    let start = body
        .iter()
        .position(|&b| !(b.is_ascii_whitespace() || b == b','))
        .unwrap_or(body.len());
    let body = &body[start..];

    let trimmed = body.trim_ascii_end();
    if trimmed.is_empty() || trimmed == b"]" {
        return None;
    }
    Some(body)
}

/// Parse one flat object, rendering scalar values as strings.
fn parse_object(body: &[u8]) -> Result<ComponentFields> {
    let raw: indexmap::IndexMap<String, Value> = serde_json::from_slice(body)?;
    raw.into_iter()
        .map(|(field, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                Value::Bool(_) | Value::Number(_) => value.to_string(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(KeeperError::format(format!(
                        "field '{field}' holds a nested value"
                    )))
                }
            };
            Ok((field, text))
        })
        .collect()
}

pub struct ObjectStreamDecoder {
    schema: Arc<dyn SchemaSource>,
    output: mpsc::Sender<NormalizedTuple>,
}

impl ObjectStreamDecoder {
    pub fn new(schema: Arc<dyn SchemaSource>, output: mpsc::Sender<NormalizedTuple>) -> Self {
        Self { schema, output }
    }
}

#[async_trait]
impl RecordDecoder for ObjectStreamDecoder {
    fn format(&self) -> PayloadFormat {
        PayloadFormat::ObjectStream
    }

    async fn decode(
        &self,
        list_id: &str,
        payload: StagedPayload,
        cancel: &CancellationToken,
    ) -> Result<DecodeSummary> {
        let mut tokens = ObjectTokenizer::new(payload);
        let mut summary = DecodeSummary::default();
        let mut widest = 0;
        let mut first = true;

        loop {
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(list_id, emitted = summary.emitted, "Object stream decode cancelled");
                    return Err(KeeperError::Cancelled);
                }
                token = tokens.next_token() => token?,
            };
            let Some(token) = token else { break };

            let Some(body) = object_body(&token, std::mem::take(&mut first)) else {
                continue;
            };

            let fields = match parse_object(body) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(list_id, error = %e, "Skipping undecodable object");
                    summary.skipped += 1;
                    continue;
                }
            };

            // A wider object may introduce fields the schema has not seen
            if fields.len() > widest {
                widest = fields.len();
                let names: Vec<String> = fields.keys().cloned().collect();
                self.schema.reconcile_field_names(list_id, &names)?;
            }

            let parameters = self.schema.parameters(list_id)?;
            let name_field = parameters
                .get(PARAM_NAME_FIELD)
                .map(String::as_str)
                .unwrap_or(DEFAULT_NAME_FIELD);

            let Some(name) = fields.get(name_field).cloned() else {
                debug!(list_id, name_field, "Skipping object without a name");
                summary.skipped += 1;
                continue;
            };

            let document = encode(&fields, &parameters)?;
            self.output
                .send(NormalizedTuple::tracked(list_id, name, document))
                .await
                .map_err(|_| KeeperError::Cancelled)?;
            summary.emitted += 1;
        }

        info!(
            list_id,
            emitted = summary.emitted,
            skipped = summary.skipped,
            "Object stream decoded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use keeper_common::SchemaParameters;
    use std::io::Cursor;

    fn payload(text: &str) -> StagedPayload {
        Box::new(Cursor::new(text.as_bytes().to_vec()))
    }

    async fn decode_all(text: &str) -> (Result<DecodeSummary>, Vec<NormalizedTuple>, Arc<SchemaRegistry>) {
        let schema = Arc::new(SchemaRegistry::new());
        let (tx, mut rx) = mpsc::channel(64);
        let decoder = ObjectStreamDecoder::new(schema.clone(), tx);

        let result = decoder
            .decode("L1abcdef", payload(text), &CancellationToken::new())
            .await;
        drop(decoder);

        let mut tuples = Vec::new();
        while let Some(tuple) = rx.recv().await {
            tuples.push(tuple);
        }
        (result, tuples, schema)
    }

    #[tokio::test]
    async fn test_single_object() {
        let (result, tuples, schema) = decode_all(r#"[{"part name":"R1","value":"10k"}]"#).await;

        assert_eq!(result.unwrap().emitted, 1);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].name, "R1");
        assert!(tuples[0].tracking);

        let doc: Value = serde_json::from_slice(&tuples[0].payload).unwrap();
        assert_eq!(doc["component"]["value"], "10k");
        assert_eq!(doc["parameters"]["id"], "L1abcdef");
        assert_eq!(
            schema.field_order("L1abcdef").unwrap().0,
            vec!["part name", "value"]
        );
    }

    #[tokio::test]
    async fn test_separators_and_scalars() {
        let text = "[\n  {\"part name\":\"R1\",\"qty\":5},\n  {\"part name\":\"R2\",\"qty\":null}\n]\n";
        let (result, tuples, _) = decode_all(text).await;

        assert_eq!(result.unwrap().emitted, 2);
        let doc: Value = serde_json::from_slice(&tuples[0].payload).unwrap();
        assert_eq!(doc["component"]["qty"], "5");
        assert_eq!(tuples[1].name, "R2");
    }

    #[tokio::test]
    async fn test_wider_object_extends_schema() {
        let text = r#"[{"part name":"R1"},{"part name":"R2","package":"0603"}]"#;
        let (_, tuples, schema) = decode_all(text).await;

        assert_eq!(tuples.len(), 2);
        assert_eq!(
            schema.field_order("L1abcdef").unwrap().0,
            vec!["part name", "package"]
        );
        let doc: Value = serde_json::from_slice(&tuples[1].payload).unwrap();
        assert_eq!(doc["parameters"]["fieldNames"], "part name, package");
    }

    #[tokio::test]
    async fn test_bad_objects_are_skipped() {
        let text = r#"[{"part name":"R1"},{"value":"10k"},{"part name":"R2","note":"a}b"},{"part name":"R3"}]"#;
        let (result, tuples, _) = decode_all(text).await;

        let summary = result.unwrap();
        let names: Vec<_> = tuples.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["R1", "R3"]);
        assert_eq!(summary.skipped, 3);
    }

    #[tokio::test]
    async fn test_empty_array() {
        let (result, tuples, _) = decode_all("[]").await;
        assert_eq!(result.unwrap(), DecodeSummary::default());
        assert!(tuples.is_empty());
    }

    struct NoParameters;

    impl SchemaSource for NoParameters {
        fn field_order(&self, list_id: &str) -> Result<(Vec<String>, usize)> {
            Err(KeeperError::lookup(list_id))
        }

        fn parameters(&self, list_id: &str) -> Result<SchemaParameters> {
            Err(KeeperError::lookup(list_id))
        }

        fn reconcile_field_names(&self, _list_id: &str, _observed: &[String]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_parameter_lookup_failure_is_fatal() {
        let (tx, mut rx) = mpsc::channel(4);
        let decoder = ObjectStreamDecoder::new(Arc::new(NoParameters), tx);

        let err = decoder
            .decode(
                "L1",
                payload(r#"[{"part name":"R1"},{"part name":"R2"}]"#),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        drop(decoder);

        assert!(matches!(err, KeeperError::Lookup(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tokenizer_limits_unterminated_object() {
        let mut tokens = ObjectTokenizer::with_max_len(payload(r#"{"a":"1"},{"b":"xxxxxxxxxxxxxxxxxxxx"#), 16);

        assert_eq!(tokens.next_token().await.unwrap().unwrap(), br#"{"a":"1"}"#);
        assert!(matches!(tokens.next_token().await, Err(KeeperError::Format(_))));
    }

    #[tokio::test]
    async fn test_oversized_object_fails_payload() {
        let text = format!(r#"[{{"part name":"R1"}},{{"part name":"{}"#, "x".repeat(MAX_OBJECT_LEN + 1));
        let (result, tuples, _) = decode_all(&text).await;

        assert!(matches!(result, Err(KeeperError::Format(_))));
        assert_eq!(tuples.len(), 1);
    }

    #[test]
    fn test_object_body_framing() {
        assert_eq!(object_body(b"[ {\"a\":\"1\"}", true), Some(&b"{\"a\":\"1\"}"[..]));
        assert_eq!(object_body(b",\n{\"a\":\"1\"}", false), Some(&b"{\"a\":\"1\"}"[..]));
        assert_eq!(object_body(b"\n]\n", false), None);
        assert_eq!(object_body(b"", false), None);
    }
}

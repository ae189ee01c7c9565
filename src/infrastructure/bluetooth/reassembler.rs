//! Stream Reassembler
//!
//! Turns telemetry fragments into complete JSON envelopes and decodes those
//! into quaternion samples.
//!
//! ## Framing
//!
//! The transport carries no length prefix. A message starts at the first `{`
//! and ends at the first `}` after it. Firmware emits flat single-level JSON,
//! so a `}` nested inside a payload would mis-cut the message; that slice then
//! fails to parse and the buffer is dropped.
//!
//! ## Envelope shapes
//!
//! ```text
//! encoded: {"<f>_format":"float32_le_base64","<f>_floats":N,"<f>_b64":"..."}
//! legacy:  {"<f>":[[w,x,y,z], ...]}
//! ```

use crate::domain::models::TelemetrySample;
use crate::error::EnvelopeError;
use data_encoding::BASE64;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

/// Encoding tag carried by the encoded envelope shape
pub const FLOAT32_LE_BASE64: &str = "float32_le_base64";

const FORMAT_SUFFIX: &str = "_format";
const FLOATS_SUFFIX: &str = "_floats";
const B64_SUFFIX: &str = "_b64";

/// Components per sample (w, x, y, z)
pub const COMPONENTS: usize = 4;

/// Per-channel reassembly buffer.
///
/// Invariant: the buffer is empty or starts with `{`.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffer: Vec<u8>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns every batch completed by it, in order.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<Vec<TelemetrySample>> {
        let mut batches = Vec::new();

        if self.buffer.is_empty() {
            // Not a message start yet
            let Some(start) = fragment.iter().position(|&b| b == b'{') else {
                trace!("Dropping {} bytes outside any message", fragment.len());
                return batches;
            };
            self.buffer.extend_from_slice(&fragment[start..]);
        } else {
            self.buffer.extend_from_slice(fragment);
        }

        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == b'{') else {
                self.buffer.clear();
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            let Some(end) = self.buffer.iter().position(|&b| b == b'}') else {
                break;
            };

            match decode_envelope(&self.buffer[..=end]) {
                Ok(samples) => {
                    if !samples.is_empty() {
                        batches.push(samples);
                    }
                    self.buffer.drain(..=end);
                }
                Err(e) => {
                    if e.is_framing() {
                        warn!("Bad telemetry JSON, dropping buffer: {}", e);
                    } else {
                        warn!("Undecodable telemetry envelope, dropping buffer: {}", e);
                    }
                    self.buffer.clear();
                    break;
                }
            }
        }

        batches
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

/// Parse and decode one framed slice
pub fn decode_envelope(slice: &[u8]) -> Result<Vec<TelemetrySample>, EnvelopeError> {
    let object: Map<String, Value> = serde_json::from_slice(slice)?;

    if let Some(field) = object
        .keys()
        .find_map(|k| k.strip_suffix(FORMAT_SUFFIX))
    {
        return decode_encoded(&object, field);
    }

    if let Some(rows) = object.values().find_map(|v| match v {
        Value::Array(rows) if rows.iter().all(Value::is_array) => Some(rows),
        _ => None,
    }) {
        return decode_literal(rows);
    }

    Err(EnvelopeError::Unrecognized)
}

fn decode_encoded(object: &Map<String, Value>, field: &str) -> Result<Vec<TelemetrySample>, EnvelopeError> {
    let format = object
        .get(&format!("{field}{FORMAT_SUFFIX}"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if format != FLOAT32_LE_BASE64 {
        return Err(EnvelopeError::UnsupportedFormat(format.to_string()));
    }

    let declared = object
        .get(&format!("{field}{FLOATS_SUFFIX}"))
        .and_then(as_count)
        .unwrap_or(-1);
    if declared <= 0 || declared as usize % COMPONENTS != 0 {
        return Err(EnvelopeError::InvalidFloatCount(declared));
    }

    let b64 = object
        .get(&format!("{field}{B64_SUFFIX}"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if b64.trim().is_empty() {
        debug!("Envelope for {:?} carries an empty payload", field);
        return Ok(Vec::new());
    }

    let floats = decode_float32_le_base64(b64, declared as usize)?;
    Ok(floats
        .chunks_exact(COMPONENTS)
        .map(|q| TelemetrySample::new(q[0], q[1], q[2], q[3]))
        .collect())
}

fn decode_literal(rows: &[Value]) -> Result<Vec<TelemetrySample>, EnvelopeError> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let values = row.as_array().ok_or(EnvelopeError::InvalidRow(i))?;
            if values.len() < COMPONENTS {
                return Err(EnvelopeError::InvalidRow(i));
            }
            let mut q = [0f32; COMPONENTS];
            for (slot, v) in q.iter_mut().zip(values) {
                *slot = v.as_f64().ok_or(EnvelopeError::InvalidRow(i))? as f32;
            }
            Ok(TelemetrySample::new(q[0], q[1], q[2], q[3]))
        })
        .collect()
}

/// Decode base64 into little-endian `f32`s, checking the declared count
pub fn decode_float32_le_base64(b64: &str, expected: usize) -> Result<Vec<f32>, EnvelopeError> {
    let raw = match BASE64.decode(b64.as_bytes()) {
        Ok(raw) => raw,
        Err(_) => {
            // Lenient retry: firmware occasionally wraps long payloads
            let compact: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            BASE64.decode(compact.as_bytes())?
        }
    };

    if raw.len() % 4 != 0 {
        return Err(EnvelopeError::ByteLength(raw.len()));
    }

    let actual = raw.len() / 4;
    if actual != expected {
        return Err(EnvelopeError::CountMismatch { expected, actual });
    }

    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ONE_SAMPLE: &str =
        r#"{"x_format":"float32_le_base64","x_floats":4,"x_b64":"AAAAAAAAgD8AAABAAABAQA=="}"#;

    fn encode(floats: &[f32]) -> String {
        let bytes: Vec<u8> = floats.iter().flat_map(|f| f.to_le_bytes()).collect();
        BASE64.encode(&bytes)
    }

    fn envelope(field: &str, floats: &[f32]) -> String {
        format!(
            r#"{{"{field}_format":"float32_le_base64","{field}_floats":{},"{field}_b64":"{}"}}"#,
            floats.len(),
            encode(floats)
        )
    }

    #[test]
    fn test_single_encoded_envelope() {
        let mut r = StreamReassembler::new();
        let batches = r.push(ONE_SAMPLE.as_bytes());
        assert_eq!(batches, vec![vec![TelemetrySample::new(0.0, 1.0, 2.0, 3.0)]]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_three_fragments() {
        let mut r = StreamReassembler::new();
        let bytes = ONE_SAMPLE.as_bytes();
        assert!(r.push(&bytes[..10]).is_empty());
        assert!(r.push(&bytes[10..50]).is_empty());
        let batches = r.push(&bytes[50..]);
        assert_eq!(batches, vec![vec![TelemetrySample::new(0.0, 1.0, 2.0, 3.0)]]);
    }

    #[test]
    fn test_garbage_before_start_is_dropped() {
        let mut r = StreamReassembler::new();
        assert!(r.push(b"noise without braces").is_empty());
        assert!(r.is_empty());

        let mut fragment = b"xx".to_vec();
        fragment.extend_from_slice(ONE_SAMPLE.as_bytes());
        assert_eq!(r.push(&fragment).len(), 1);
    }

    #[test]
    fn test_two_envelopes_in_one_fragment() {
        let first = envelope("mpuProcessedData", &[1.0, 0.0, 0.0, 0.0]);
        let second = envelope("mpuProcessedData", &[0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 1.0]);
        let mut r = StreamReassembler::new();
        let batches = r.push(format!("{first}{second}").as_bytes());

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![TelemetrySample::new(1.0, 0.0, 0.0, 0.0)]);
        assert_eq!(
            batches[1],
            vec![
                TelemetrySample::new(0.5, 0.5, 0.5, 0.5),
                TelemetrySample::new(0.0, 0.0, 0.0, 1.0)
            ]
        );
    }

    #[test]
    fn test_trailing_partial_is_retained() {
        let first = envelope("q", &[1.0, 2.0, 3.0, 4.0]);
        let second = envelope("q", &[5.0, 6.0, 7.0, 8.0]);
        let mut r = StreamReassembler::new();

        let split = 12;
        let batches = r.push(format!("{first}{}", &second[..split]).as_bytes());
        assert_eq!(batches.len(), 1);
        assert_eq!(r.buffered(), second[..split].as_bytes());

        let batches = r.push(second[split..].as_bytes());
        assert_eq!(batches, vec![vec![TelemetrySample::new(5.0, 6.0, 7.0, 8.0)]]);
    }

    #[test]
    fn test_legacy_literal_rows() {
        let mut r = StreamReassembler::new();
        let batches = r.push(br#"{"mpuProcessedData":[[1,0,0,0],[0.5,0.5,0.5,0.5,9]]}"#);
        assert_eq!(
            batches,
            vec![vec![
                TelemetrySample::new(1.0, 0.0, 0.0, 0.0),
                TelemetrySample::new(0.5, 0.5, 0.5, 0.5)
            ]]
        );
    }

    #[test]
    fn test_legacy_short_row_is_rejected() {
        assert!(matches!(
            decode_envelope(br#"{"q":[[1,0,0,0],[1,2]]}"#),
            Err(EnvelopeError::InvalidRow(1))
        ));
    }

    #[test]
    fn test_count_not_multiple_of_four() {
        let json = r#"{"x_format":"float32_le_base64","x_floats":3,"x_b64":"AAAAAAAAgD8AAABA"}"#;
        let mut r = StreamReassembler::new();
        assert!(r.push(json.as_bytes()).is_empty());
        assert!(r.is_empty());
        assert!(matches!(
            decode_envelope(json.as_bytes()),
            Err(EnvelopeError::InvalidFloatCount(3))
        ));
    }

    #[test]
    fn test_non_positive_count() {
        let json = r#"{"x_format":"float32_le_base64","x_floats":0,"x_b64":"AAAAAA=="}"#;
        assert!(matches!(
            decode_envelope(json.as_bytes()),
            Err(EnvelopeError::InvalidFloatCount(0))
        ));
    }

    #[test]
    fn test_count_mismatch() {
        let json = r#"{"x_format":"float32_le_base64","x_floats":8,"x_b64":"AAAAAAAAgD8AAABAAABAQA=="}"#;
        let mut r = StreamReassembler::new();
        assert!(r.push(json.as_bytes()).is_empty());
        assert!(r.is_empty());
        assert!(matches!(
            decode_envelope(json.as_bytes()),
            Err(EnvelopeError::CountMismatch { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn test_byte_length_not_multiple_of_four() {
        // 6 raw bytes
        let err = decode_float32_le_base64("AAAAAAAA", 4).unwrap_err();
        assert!(matches!(err, EnvelopeError::ByteLength(6)));
    }

    #[test]
    fn test_bad_base64() {
        let err = decode_float32_le_base64("!!!!", 4).unwrap_err();
        assert!(matches!(err, EnvelopeError::Base64(_)));
    }

    #[test]
    fn test_wrapped_base64_is_accepted() {
        let floats = decode_float32_le_base64("AAAAAAAA\ngD8AAABA\r\nAABAQA==", 4).unwrap();
        assert_eq!(floats, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unsupported_format() {
        let json = r#"{"x_format":"int16","x_floats":4,"x_b64":"AAAA"}"#;
        assert!(matches!(
            decode_envelope(json.as_bytes()),
            Err(EnvelopeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_empty_payload_emits_nothing() {
        let json = r#"{"x_format":"float32_le_base64","x_floats":4,"x_b64":""}"#;
        let mut r = StreamReassembler::new();
        assert!(r.push(json.as_bytes()).is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn test_decode_error_drops_rest_of_buffer() {
        let bad = r#"{"x_format":"float32_le_base64","x_floats":8,"x_b64":"AAAAAAAAgD8AAABAAABAQA=="}"#;
        let mut r = StreamReassembler::new();
        let batches = r.push(format!("{bad}{ONE_SAMPLE}").as_bytes());
        assert!(batches.is_empty());
        assert!(r.is_empty());

        // A partial follower is discarded too
        let batches = r.push(format!("{bad}{}", &ONE_SAMPLE[..20]).as_bytes());
        assert!(batches.is_empty());
        assert!(r.is_empty());

        // The stream resumes with the next message start
        assert_eq!(r.push(ONE_SAMPLE.as_bytes()).len(), 1);
    }

    #[test]
    fn test_nested_brace_miscut_drops_buffer() {
        let mut r = StreamReassembler::new();
        let batches = r.push(format!(r#"{{"meta":{{"v":1}},"q":[[1,0,0,0]]}}{ONE_SAMPLE}"#).as_bytes());
        assert!(batches.is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn test_unparseable_slice_drops_buffer() {
        let mut r = StreamReassembler::new();
        assert!(r.push(b"{not json}").is_empty());
        assert!(r.is_empty());
        assert_eq!(r.push(ONE_SAMPLE.as_bytes()).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(
            floats in prop::collection::vec(-1.0f32..1.0, 1..6)
                .prop_map(|q| q.into_iter().cycle().take(8).collect::<Vec<_>>()),
            cuts in prop::collection::vec(0usize..400, 0..6),
        ) {
            let mut cuts = cuts;
            let message = envelope("mpuProcessedData", &floats);
            let bytes = message.as_bytes();

            let mut whole = StreamReassembler::new();
            let expected = whole.push(bytes);
            prop_assert_eq!(expected.len(), 1);

            cuts.iter_mut().for_each(|c| *c %= bytes.len() + 1);
            cuts.sort_unstable();
            let mut pieces = Vec::new();
            let mut last = 0;
            for cut in cuts.into_iter().chain(std::iter::once(bytes.len())) {
                pieces.push(&bytes[last..cut]);
                last = cut;
            }

            let mut fragmented = StreamReassembler::new();
            let mut got = Vec::new();
            for piece in pieces {
                got.extend(fragmented.push(piece));
            }
            prop_assert_eq!(got, expected);
            prop_assert!(fragmented.is_empty());
        }
    }
}

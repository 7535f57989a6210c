//! Incremental decoding of the omni generate stream.
//!
//! The inference service answers `streaming_generate` with SSE `data:` lines
//! carrying JSON records such as `{"type":"text","content":"..."}`, terminated
//! by `data: [DONE]`. [`SseDecoder`] reassembles lines across chunk boundaries
//! and classifies every record. A malformed record never aborts the stream; it
//! is counted and skipped.

/// Literal payload that ends the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest unterminated line kept before it is dropped as malformed.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Classification of a single `data:` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    /// A record tagged `"type": "text"`, with its content fragment.
    Text(String),
    /// Well-formed JSON that carries no text (audio, status, ...).
    Other,
    /// Not decodable; skipped.
    Malformed,
    /// The `[DONE]` sentinel.
    EndOfStream,
}

/// Counters describing a decoded stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub text_records: u64,
    pub other_records: u64,
    pub malformed_records: u64,
    pub done_received: bool,
}

impl DecodeSummary {
    /// Emit the counters once the stream is over.
    pub fn log(&self) {
        if self.malformed_records > 0 {
            tracing::warn!(
                text = self.text_records,
                other = self.other_records,
                malformed = self.malformed_records,
                done = self.done_received,
                "Generate stream finished with malformed records skipped"
            );
        } else {
            tracing::debug!(
                text = self.text_records,
                other = self.other_records,
                done = self.done_received,
                "Generate stream finished"
            );
        }
    }
}

/// Classify the payload of one `data:` line.
pub fn classify(data: &str) -> StreamRecord {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return StreamRecord::EndOfStream;
    }

    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(record) if record.get("type").and_then(|t| t.as_str()) == Some("text") => {
            let content = record
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            StreamRecord::Text(content.to_string())
        }
        Ok(_) => StreamRecord::Other,
        Err(_) => StreamRecord::Malformed,
    }
}

/// Line-buffering SSE decoder.
///
/// Feed raw bytes with [`push`](SseDecoder::push); every call returns the
/// records completed by that chunk, in order. Input after the sentinel is
/// ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    summary: DecodeSummary,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the end sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.summary.done_received
    }

    pub fn summary(&self) -> &DecodeSummary {
        &self.summary
    }

    /// Process a chunk of bytes from the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamRecord> {
        let mut records = Vec::new();
        if self.is_finished() {
            return records;
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(record) = self.process_line(&line) {
                let done = record == StreamRecord::EndOfStream;
                records.push(record);
                if done {
                    self.buffer.clear();
                    return records;
                }
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                "Dropping oversized stream line without terminator"
            );
            self.buffer.clear();
            self.summary.malformed_records += 1;
            records.push(StreamRecord::Malformed);
        }

        records
    }

    /// Flush whatever is left in the buffer as a final line.
    pub fn finish(&mut self) -> Vec<StreamRecord> {
        if self.is_finished() || self.buffer.is_empty() {
            self.buffer.clear();
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(&line).into_iter().collect()
    }

    /// Process a single line; non-`data:` lines yield nothing.
    fn process_line(&mut self, raw: &[u8]) -> Option<StreamRecord> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches(['\n', '\r']),
            Err(_) => {
                tracing::debug!("Skipping stream line that is not valid UTF-8");
                self.summary.malformed_records += 1;
                return Some(StreamRecord::Malformed);
            }
        };

        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);

        let record = classify(data);
        match &record {
            StreamRecord::Text(_) => self.summary.text_records += 1,
            StreamRecord::Other => self.summary.other_records += 1,
            StreamRecord::Malformed => {
                self.summary.malformed_records += 1;
                tracing::debug!(line = %data, "Skipping malformed stream record");
            }
            StreamRecord::EndOfStream => self.summary.done_received = true,
        }
        Some(record)
    }
}

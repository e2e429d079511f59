use serde_json::Value;

/// Incremental extractor for JSON objects from an arbitrary-chunked byte
/// stream.
///
/// The CLI emits newline-delimited JSON most of the time but will
/// occasionally concatenate objects on one line, so line splitting corrupts
/// the stream. This scanner tracks brace depth with string/escape awareness
/// and yields each complete top-level object as soon as its closing brace
/// arrives. Incomplete trailing data stays buffered for the next chunk.
#[derive(Debug, Default)]
pub struct JsonStreamParser {
    buf: Vec<u8>,
}

impl JsonStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete object it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let (values, consumed) = extract_json_objects(&self.buf);
        self.buf.drain(..consumed);
        values
    }

    /// Bytes still waiting for more input.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

/// Scan `buf` for complete top-level JSON objects.
///
/// Returns the parsed objects and the number of bytes consumed: everything up
/// to and including the last complete object. Slices that fail to parse are
/// dropped silently. Bytes outside any object (whitespace, stray `}`) advance
/// the scan but are only consumed once a later object completes.
pub fn extract_json_objects(buf: &[u8]) -> (Vec<Value>, usize) {
    let mut values = Vec::new();
    let mut consumed = 0usize;

    let mut depth = 0u32;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in buf.iter().enumerate() {
        if depth == 0 {
            // Between objects: nothing but an opening brace matters here.
            if b == b'{' {
                depth = 1;
                start = i;
                in_string = false;
                escape_next = false;
            }
            continue;
        }

        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match b {
                b'\\' => escape_next = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    if let Ok(value) = serde_json::from_slice::<Value>(&buf[start..=i]) {
                        values.push(value);
                    }
                    consumed = i + 1;
                }
            }
            _ => {}
        }
    }

    (values, consumed)
}

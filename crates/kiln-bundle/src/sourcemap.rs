//! Line-level v3 sourcemap generation.

use serde::Serialize;

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Serialized form of a v3 sourcemap.
#[derive(Debug, Serialize)]
struct SourceMapV3<'a> {
    version: u8,
    file: &'a str,
    sources: &'a [String],
    #[serde(rename = "sourcesContent")]
    sources_content: &'a [String],
    names: [&'a str; 0],
    mappings: &'a str,
}

/// Accumulates one mapping per generated line.
///
/// Every mapped line points at column 0 of a source line; unmapped lines
/// (the bundle runtime) produce empty groups.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    contents: Vec<String>,
    mappings: String,
    lines: usize,
    prev_source: i64,
    prev_line: i64,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source file and return its index.
    pub fn add_source(&mut self, name: impl Into<String>, content: impl Into<String>) -> usize {
        self.sources.push(name.into());
        self.contents.push(content.into());
        self.sources.len() - 1
    }

    /// Record a generated line with no original position.
    pub fn unmapped_line(&mut self) {
        self.separate();
    }

    /// Record a generated line that originates from `line` (0-based) of `source`.
    pub fn mapped_line(&mut self, source: usize, line: usize) {
        self.separate();
        let source = source as i64;
        let line = line as i64;
        encode_vlq(0, &mut self.mappings);
        encode_vlq(source - self.prev_source, &mut self.mappings);
        encode_vlq(line - self.prev_line, &mut self.mappings);
        encode_vlq(0, &mut self.mappings);
        self.prev_source = source;
        self.prev_line = line;
    }

    fn separate(&mut self) {
        if self.lines > 0 {
            self.mappings.push(';');
        }
        self.lines += 1;
    }

    pub fn to_json(&self, file: &str) -> serde_json::Result<String> {
        serde_json::to_string(&SourceMapV3 {
            version: 3,
            file,
            sources: &self.sources,
            sources_content: &self.contents,
            names: [],
            mappings: &self.mappings,
        })
    }
}

/// Append the base64 VLQ encoding of `value`.
pub(crate) fn encode_vlq(value: i64, out: &mut String) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };
    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

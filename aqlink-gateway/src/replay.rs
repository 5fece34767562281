// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replay of recorded envelopes from a file
//!
//! Accepted input:
//!
//! ```text
//! # comment
//! // comment
//! v3/app/devices/kit/up {"end_device_ids": ...}       <- mosquitto_sub -v
//! { "app_id": "a",                                     <- spread over lines
//!   "dev_id": "d", "port": 2, "payload_raw": "AQ==" }
//! ```
//!
//! Hex numbers such as `[0x1F, 0x0A]` are rewritten to decimal before
//! parsing. Records that do not parse are logged and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::envelope::Envelope;

/// One recorded envelope file
pub struct FileSource {
    path: PathBuf,
    name: String,
    lines: Option<Lines<BufReader<File>>>,
    max_fields: usize,
    line_no: usize,
    records: usize,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, max_fields: usize) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        info!(path = %path.display(), "replaying envelopes");
        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            lines: Some(BufReader::new(file).lines()),
            max_fields,
            line_no: 0,
            records: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether end of file was reached
    pub fn is_exhausted(&self) -> bool {
        self.lines.is_none()
    }

    /// Envelopes produced so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Next envelope, skipping what does not parse; `None` at end of file
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            let (start, text) = self.next_record()?;
            match Envelope::parse(&hex_to_decimal(&text), self.max_fields) {
                Ok(envelope) => {
                    self.records += 1;
                    return Some(envelope.with_source(self.name.clone()));
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = start,
                        error = %e,
                        "skipping recorded envelope"
                    );
                }
            }
        }
    }

    /// Accumulate lines until the braces balance
    fn next_record(&mut self) -> Option<(usize, String)> {
        let mut record = String::new();
        let mut depth = 0i32;
        let mut start = 0;

        loop {
            let line = match self.lines.as_mut()?.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(path = %self.path.display(), error = %e, "read failed");
                    self.finish();
                    return None;
                }
                None => {
                    if !record.trim().is_empty() {
                        warn!(path = %self.path.display(), line = start, "unterminated record at end of file");
                    }
                    self.finish();
                    return None;
                }
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if record.is_empty() {
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
                    continue;
                }
                start = self.line_no;
            }

            let body = if record.is_empty() {
                strip_topic(trimmed)
            } else {
                trimmed
            };
            depth += brace_balance(body);
            record.push_str(body);
            record.push('\n');

            if depth <= 0 {
                return Some((start, record));
            }
        }
    }

    fn finish(&mut self) {
        if self.lines.take().is_some() {
            debug!(path = %self.path.display(), records = self.records, "replay exhausted");
        }
    }
}

/// Drop a leading `topic ` as printed by `mosquitto_sub -v`
fn strip_topic(line: &str) -> &str {
    match line.find('{') {
        Some(pos) if pos > 0 && line[..pos].trim_end().split_whitespace().count() == 1 => {
            &line[pos..]
        }
        _ => line,
    }
}

/// Net `{`/`}` count outside string literals
fn brace_balance(text: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Rewrite `0x..` numbers outside string literals as decimal
fn hex_to_decimal(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let Some(c) = text[i..].chars().next() else {
            break;
        };
        let width = c.len_utf8();
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            i += width;
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        let at_number_start = i == 0 || !(bytes[i - 1] as char).is_ascii_alphanumeric();
        if c == '0'
            && at_number_start
            && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X'))
            && bytes.get(i + 2).map_or(false, u8::is_ascii_hexdigit)
        {
            let mut end = i + 2;
            while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                end += 1;
            }
            if let Ok(value) = u64::from_str_radix(&text[i + 2..end], 16) {
                out.push_str(&value.to_string());
                i = end;
                continue;
            }
        }
        out.push(c);
        i += width;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_decimal() {
        assert_eq!(hex_to_decimal("[0x1F, 0x0A]"), "[31, 10]");
        assert_eq!(hex_to_decimal(r#"{"id": "0x1F", "v": 0xff}"#), r#"{"id": "0x1F", "v": 255}"#);
        assert_eq!(hex_to_decimal("10x5"), "10x5");
        assert_eq!(hex_to_decimal("\"é\" 0x10"), "\"é\" 16");
    }

    #[test]
    fn test_strip_topic() {
        assert_eq!(strip_topic(r#"v3/app/devices/kit/up {"a": 1}"#), r#"{"a": 1}"#);
        assert_eq!(strip_topic(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_brace_balance_ignores_strings() {
        assert_eq!(brace_balance(r#"{ "x": "}{" "#), 1);
        assert_eq!(brace_balance(r#"{ "x": "\"}" }"#), 0);
    }
}

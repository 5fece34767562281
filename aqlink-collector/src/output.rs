// aqlink Collector - record output
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! JSON-lines output of canonical records.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use aqlink_gateway::CanonicalRecord;

/// Where records are written, one JSON object per line
pub enum RecordSink {
    Stdout(io::Stdout),
    /// Appends to a file
    File(BufWriter<File>),
}

impl RecordSink {
    pub fn stdout() -> Self {
        Self::Stdout(io::stdout())
    }

    pub fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::File(BufWriter::new(file)))
    }

    /// Write one record and flush it
    pub fn write(&mut self, record: &CanonicalRecord) -> io::Result<()> {
        let line = record
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match self {
            Self::Stdout(out) => {
                let mut out = out.lock();
                writeln!(out, "{}", line)?;
                out.flush()
            }
            Self::File(out) => {
                writeln!(out, "{}", line)?;
                out.flush()
            }
        }
    }
}

//! NDJSON output on stdout.

use std::io::{self, BufWriter, StdoutLock, Write};

use anyhow::{Context, Result};
use serde::Serialize;

pub struct NdjsonWriter {
    out: BufWriter<StdoutLock<'static>>,
    lines: u64,
}

impl NdjsonWriter {
    pub fn stdout() -> Self {
        Self {
            out: BufWriter::new(io::stdout().lock()),
            lines: 0,
        }
    }

    /// Write one value as a single JSON line.
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, value).context("Failed to serialize output line")?;
        self.out.write_all(b"\n").context("Failed to write to stdout")?;
        self.lines += 1;
        Ok(())
    }

    /// Write each item on its own line.
    pub fn write_all<'a, T, I>(&mut self, items: I) -> Result<()>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        for item in items {
            self.write(item)?;
        }
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush stdout")
    }
}

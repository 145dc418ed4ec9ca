//! Output sinks for script-visible text.
//!
//! Everything a build prints (`echo`, command output, replayed cache
//! output) goes through a [`BuildOutput`] so tests can capture it
//! without touching the process's stdout.

use std::io::{self, Write as _};

/// Sink for build output lines.
///
/// Both channels append a newline when the payload does not end in one,
/// mirroring how command output is echoed line-wise.
pub trait BuildOutput {
    /// Writes to the stdout channel.
    fn out(&mut self, bytes: &[u8]);

    /// Writes to the stderr channel.
    fn err(&mut self, bytes: &[u8]);
}

fn push_auto_newline(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(bytes);
    if !bytes.ends_with(b"\n") {
        buffer.push(b'\n');
    }
}

/// Writes to the real stdout/stderr.
#[derive(Debug, Default)]
pub struct StdOutput;

impl BuildOutput for StdOutput {
    fn out(&mut self, bytes: &[u8]) {
        let mut buffer = Vec::with_capacity(bytes.len() + 1);
        push_auto_newline(&mut buffer, bytes);
        let _ = io::stdout().write_all(&buffer);
        let _ = io::stdout().flush();
    }

    fn err(&mut self, bytes: &[u8]) {
        let mut buffer = Vec::with_capacity(bytes.len() + 1);
        push_auto_newline(&mut buffer, bytes);
        let _ = io::stderr().write_all(&buffer);
    }
}

/// Collects both channels into buffers. Used by tests.
#[derive(Debug, Default)]
pub struct CollectOutput {
    pub out: Vec<u8>,
    pub err: Vec<u8>,
}

impl CollectOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected stdout as text.
    #[must_use]
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }

    /// Collected stderr as text.
    #[must_use]
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.err).into_owned()
    }
}

impl BuildOutput for CollectOutput {
    fn out(&mut self, bytes: &[u8]) {
        push_auto_newline(&mut self.out, bytes);
    }

    fn err(&mut self, bytes: &[u8]) {
        push_auto_newline(&mut self.err, bytes);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoOutput;

impl BuildOutput for NoOutput {
    fn out(&mut self, _bytes: &[u8]) {}

    fn err(&mut self, _bytes: &[u8]) {}
}

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SinkError;

/// Destination for report lines, one call per processed message.
pub trait ReportSink: Send {
    fn report(&mut self, line: &str) -> Result<(), SinkError>;
}

/// Writes each line to stdout and flushes, so a line that was reported is a
/// line that left the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn report(&mut self, line: &str) -> Result<(), SinkError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ReportSink for MemorySink {
    fn report(&mut self, line: &str) -> Result<(), SinkError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn report(&mut self, line: &str) -> Result<(), SinkError> {
        (**self).report(line)
    }
}

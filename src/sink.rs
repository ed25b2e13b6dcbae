use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::Path;

use crate::trial::TrialResult;

pub const DEFAULT_RESULT_FILE: &str = "latency.txt";

/// Consumer of completed trials.
pub trait ResultSink {
    fn record(&mut self, result: &TrialResult) -> io::Result<()>;
}

impl ResultSink for Vec<TrialResult> {
    fn record(&mut self, result: &TrialResult) -> io::Result<()> {
        self.push(*result);
        Ok(())
    }
}

/// Appends one whitespace-delimited line per trial:
/// `<target rate>    <median ns>    <p99 ns>`.
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        LineSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl LineSink<File> {
    pub fn append_to<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LineSink::new(file))
    }
}

impl<W: Write> ResultSink for LineSink<W> {
    fn record(&mut self, result: &TrialResult) -> io::Result<()> {
        writeln!(
            self.out,
            "{}    {}    {}",
            result.target_rate, result.median_ns, result.p99_ns
        )?;
        // Flushed per line so a killed sweep keeps every finished trial.
        self.out.flush()
    }
}

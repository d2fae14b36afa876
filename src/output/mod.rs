//! # Output module
//!
//! Provides functionality for saving measurements gathered by the sweep engine and the latency
//! probe, and for summarising them at the end of a run.

use crate::error::{Error, Result};
use crate::sweep::IterationSample;
use console::style;
use hdrhistogram::Histogram;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

/// Provides interface for recording a result in the underlying storage
pub trait Record<T> {
    /// Saves data to the underlying storage
    fn record(&mut self, data: T) -> Result<()>;

    /// Pushes buffered records out
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T, R: Record<T> + ?Sized> Record<T> for &mut R {
    fn record(&mut self, data: T) -> Result<()> {
        (**self).record(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

pub mod file {
    //! Functionality for saving results into a file

    use super::Record;
    use crate::error::{Error, Result};
    use serde::ser::Serialize;
    use std::io::Write;

    /// Writes one json-serialized record per line
    pub struct JsonLines<W: Write> {
        inner: W,
    }

    impl<W: Write> JsonLines<W> {
        pub fn new(inner: W) -> JsonLines<W> {
            JsonLines { inner }
        }

        pub fn into_inner(self) -> W {
            self.inner
        }
    }

    impl<T: Serialize, W: Write> Record<T> for JsonLines<W> {
        fn record(&mut self, data: T) -> Result<()> {
            serde_json::to_writer(&mut self.inner, &data)
                .map_err(|e| Error::Output(e.to_string()))?;
            self.inner
                .write_all(b"\n")
                .map_err(|e| Error::Output(e.to_string()))
        }

        fn flush(&mut self) -> Result<()> {
            self.inner.flush().map_err(|e| Error::Output(e.to_string()))
        }
    }
}

pub mod vec {
    use super::Record;
    use crate::error::Result;

    /// Just pushes the data to a vector
    impl<T> Record<T> for Vec<T> {
        fn record(&mut self, data: T) -> Result<()> {
            self.push(data);
            Ok(())
        }
    }
}

/// Spinner showing the number of records seen so far; forwards every record to `inner`.
pub struct Progress<R> {
    bar: ProgressBar,
    inner: R,
}

impl<R> Progress<R> {
    pub fn new(inner: R, what: &str) -> Progress<R> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner().template("{spinner} {pos} {msg} [{elapsed}]"),
        );
        bar.set_message(what);

        Progress { bar, inner }
    }

    /// Clears the spinner and hands back the wrapped recorder
    pub fn finish(self) -> R {
        self.bar.finish_and_clear();
        self.inner
    }
}

impl<T, R: Record<T>> Record<T> for Progress<R> {
    fn record(&mut self, data: T) -> Result<()> {
        self.bar.inc(1);
        self.inner.record(data)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// Summary statistics over every recorded iteration, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub count: u64,
    pub min: u64,
    pub median: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}

/// Collects iteration timings of a run.
pub struct SweepReport {
    samples: Vec<IterationSample>,
    histogram: Histogram<u64>,
    reads: u64,
}

impl SweepReport {
    pub fn new() -> Result<SweepReport> {
        // 3 significant digits are plenty at nanosecond resolution
        let histogram = Histogram::new(3).map_err(|e| Error::Output(format!("{:?}", e)))?;

        Ok(SweepReport {
            samples: Vec::new(),
            histogram,
            reads: 0,
        })
    }

    /// Writes every recorded sample to `sink`, in order.
    pub fn dump_to<R: Record<IterationSample>>(&self, sink: &mut R) -> Result<()> {
        for s in &self.samples {
            sink.record(*s)?;
        }
        sink.flush()
    }

    pub fn samples(&self) -> &[IterationSample] {
        &self.samples
    }

    /// Total number of reads over all iterations
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn summary(&self) -> Option<Summary> {
        if self.histogram.is_empty() {
            return None;
        }
        let h = &self.histogram;

        Some(Summary {
            count: h.len(),
            min: h.min(),
            median: h.value_at_quantile(0.5),
            p99: h.value_at_quantile(0.99),
            max: h.max(),
            mean: h.mean(),
        })
    }

    pub fn print(&self) {
        match self.summary() {
            None => println!("{}", style("no iterations completed").yellow()),
            Some(s) => {
                println!(
                    "{} {} iterations, {} reads",
                    style("MEASUREMENTS COMPLETED").green(),
                    s.count,
                    self.reads
                );
                println!(
                    "  min {} ns | median {} ns | p99 {} ns | max {} ns | mean {:.1} ns",
                    style(s.min).cyan(),
                    style(s.median).cyan(),
                    style(s.p99).cyan(),
                    style(s.max).cyan(),
                    s.mean
                );
            }
        }
    }
}

impl Record<IterationSample> for SweepReport {
    fn record(&mut self, data: IterationSample) -> Result<()> {
        self.histogram
            .record(data.elapsed_ns.max(1))
            .map_err(|e| Error::Output(format!("{:?}", e)))?;
        self.reads += data.reads as u64;
        self.samples.push(data);
        Ok(())
    }
}

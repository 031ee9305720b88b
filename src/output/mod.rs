//! Output tables and sinks for the pileup pipeline.

pub mod bam;
pub mod metric;
pub mod types;

pub use metric::{Metric, TableReader, write_metrics};
pub use types::{AggregatedBreakpointPileup, BedpeRecord, BreakpointPileup};

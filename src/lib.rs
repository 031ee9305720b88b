//! Structural-variant breakpoint pileup toolkit.
//!
//! Walks a query-grouped alignment stream, collapses each template's primary
//! and supplementary alignments into an ordered chain of aligned segments,
//! calls putative breakpoints between adjacent segments, and tracks the
//! split-read and read-pair evidence supporting each one. A second stage
//! clusters nearby breakpoints into aggregate events; a third projects the
//! aggregates to BEDPE.

pub mod aggregate;
pub mod bedpe;
pub mod breakpoint;
pub mod input;
pub mod output;
pub mod pileup;
pub mod segment;
pub mod template;
pub mod utils;

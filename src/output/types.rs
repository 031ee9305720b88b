//! Row types for the breakpoint, aggregate and BEDPE tables.

use anyhow::{Result, bail};
use serde::Serialize;

use super::metric::{Metric, RowView};

/// One distinct breakpoint with its supporting evidence counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointPileup {
    pub id: u64,
    pub left_contig: String,
    pub left_pos: usize,
    pub left_strand: char,
    pub right_contig: String,
    pub right_pos: usize,
    pub right_strand: char,
    pub split_reads: u64,
    pub read_pairs: u64,
    pub total: u64,
    pub left_targets: Option<String>,
    pub right_targets: Option<String>,
}

impl Metric for BreakpointPileup {
    fn column_names() -> &'static [&'static str] {
        &[
            "id",
            "left_contig",
            "left_pos",
            "left_strand",
            "right_contig",
            "right_pos",
            "right_strand",
            "split_reads",
            "read_pairs",
            "total",
            "left_targets",
            "right_targets",
        ]
    }
}

impl BreakpointPileup {
    /// Parses one table row, checking the evidence-count invariant.
    pub fn from_row(row: &RowView<'_>) -> Result<Self> {
        let pileup = BreakpointPileup {
            id: row.parse("id")?,
            left_contig: row.get("left_contig")?.to_string(),
            left_pos: row.parse("left_pos")?,
            left_strand: row.parse("left_strand")?,
            right_contig: row.get("right_contig")?.to_string(),
            right_pos: row.parse("right_pos")?,
            right_strand: row.parse("right_strand")?,
            split_reads: row.parse("split_reads")?,
            read_pairs: row.parse("read_pairs")?,
            total: row.parse("total")?,
            left_targets: row.parse_opt("left_targets")?,
            right_targets: row.parse_opt("right_targets")?,
        };
        if pileup.total != pileup.split_reads + pileup.read_pairs {
            bail!(
                "Breakpoint {}: total ({}) != split_reads ({}) + read_pairs ({})",
                pileup.id,
                pileup.total,
                pileup.split_reads,
                pileup.read_pairs
            );
        }
        Ok(pileup)
    }
}

/// A cluster of nearby breakpoints that likely describe one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedBreakpointPileup {
    pub id: String,
    pub category: String,
    pub left_contig: String,
    pub left_min_pos: usize,
    pub left_max_pos: usize,
    pub left_strand: char,
    pub right_contig: String,
    pub right_min_pos: usize,
    pub right_max_pos: usize,
    pub right_strand: char,
    pub split_reads: u64,
    pub read_pairs: u64,
    pub total: u64,
    /// Comma-joined ascending distinct left positions of the constituents.
    pub left_pileups: String,
    pub right_pileups: String,
    pub left_frequency: Option<f64>,
    pub right_frequency: Option<f64>,
    pub left_overlaps_target: Option<bool>,
    pub right_overlaps_target: Option<bool>,
    pub left_targets: Option<String>,
    pub right_targets: Option<String>,
}

impl Metric for AggregatedBreakpointPileup {
    fn column_names() -> &'static [&'static str] {
        &[
            "id",
            "category",
            "left_contig",
            "left_min_pos",
            "left_max_pos",
            "left_strand",
            "right_contig",
            "right_min_pos",
            "right_max_pos",
            "right_strand",
            "split_reads",
            "read_pairs",
            "total",
            "left_pileups",
            "right_pileups",
            "left_frequency",
            "right_frequency",
            "left_overlaps_target",
            "right_overlaps_target",
            "left_targets",
            "right_targets",
        ]
    }
}

fn parse_position_list(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .map(|p| {
            p.parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid position list entry '{}': {}", p, e))
        })
        .collect()
}

impl AggregatedBreakpointPileup {
    pub fn from_row(row: &RowView<'_>) -> Result<Self> {
        let pileup = AggregatedBreakpointPileup {
            id: row.get("id")?.to_string(),
            category: row.get("category")?.to_string(),
            left_contig: row.get("left_contig")?.to_string(),
            left_min_pos: row.parse("left_min_pos")?,
            left_max_pos: row.parse("left_max_pos")?,
            left_strand: row.parse("left_strand")?,
            right_contig: row.get("right_contig")?.to_string(),
            right_min_pos: row.parse("right_min_pos")?,
            right_max_pos: row.parse("right_max_pos")?,
            right_strand: row.parse("right_strand")?,
            split_reads: row.parse("split_reads")?,
            read_pairs: row.parse("read_pairs")?,
            total: row.parse("total")?,
            left_pileups: row.get("left_pileups")?.to_string(),
            right_pileups: row.get("right_pileups")?.to_string(),
            left_frequency: row.parse_opt("left_frequency")?,
            right_frequency: row.parse_opt("right_frequency")?,
            left_overlaps_target: row.parse_opt("left_overlaps_target")?,
            right_overlaps_target: row.parse_opt("right_overlaps_target")?,
            left_targets: row.parse_opt("left_targets")?,
            right_targets: row.parse_opt("right_targets")?,
        };
        if pileup.total != pileup.split_reads + pileup.read_pairs {
            bail!(
                "Aggregate {}: total ({}) != split_reads ({}) + read_pairs ({})",
                pileup.id,
                pileup.total,
                pileup.split_reads,
                pileup.read_pairs
            );
        }
        // Position lists must be well formed even though only the bounds are
        // consumed downstream.
        parse_position_list(&pileup.left_pileups)?;
        parse_position_list(&pileup.right_pileups)?;
        Ok(pileup)
    }
}

/// A ten-column BEDPE row: 0-based half-open intervals, no header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BedpeRecord {
    pub chrom1: String,
    pub start1: usize,
    pub end1: usize,
    pub chrom2: String,
    pub start2: usize,
    pub end2: usize,
    pub name: String,
    pub score: u64,
    pub strand1: char,
    pub strand2: char,
}

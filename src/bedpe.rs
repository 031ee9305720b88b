//! Projection of aggregated events to BEDPE.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};

use crate::output::metric::TableReader;
use crate::output::{AggregatedBreakpointPileup, BedpeRecord};

/// Maps one aggregated event to a BEDPE row, converting the 1-based
/// inclusive bounds to 0-based half-open intervals.
pub fn to_bedpe(pileup: &AggregatedBreakpointPileup) -> BedpeRecord {
    BedpeRecord {
        chrom1: pileup.left_contig.clone(),
        start1: pileup.left_min_pos - 1,
        end1: pileup.left_max_pos,
        chrom2: pileup.right_contig.clone(),
        start2: pileup.right_min_pos - 1,
        end2: pileup.right_max_pos,
        name: pileup.id.clone(),
        score: pileup.total,
        strand1: pileup.left_strand,
        strand2: pileup.right_strand,
    }
}

/// Reads an aggregated table and writes it as headerless BEDPE.
/// Returns the number of rows written.
pub fn call_to_bedpe(input_path: &str, output_path: &str) -> Result<usize> {
    let table = TableReader::open(input_path)?;
    let rows = table
        .rows()
        .map(|row| AggregatedBreakpointPileup::from_row(&row))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Invalid aggregated table {}", input_path))?;

    let file =
        File::create(output_path).with_context(|| format!("Failed to create {}", output_path))?;
    let mut writer = BufWriter::new(file);
    for pileup in &rows {
        let b = to_bedpe(pileup);
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            b.chrom1, b.start1, b.end1, b.chrom2, b.start2, b.end2, b.name, b.score, b.strand1,
            b.strand2
        )?;
    }
    writer.flush()?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregated() -> AggregatedBreakpointPileup {
        AggregatedBreakpointPileup {
            id: "112_456_5".to_string(),
            category: "Possible deletion".to_string(),
            left_contig: "chr1".to_string(),
            left_min_pos: 100,
            left_max_pos: 300,
            left_strand: '+',
            right_contig: "chr1".to_string(),
            right_min_pos: 100,
            right_max_pos: 200,
            right_strand: '-',
            split_reads: 3,
            read_pairs: 5,
            total: 8,
            left_pileups: "100,200,300".to_string(),
            right_pileups: "100,200".to_string(),
            left_frequency: None,
            right_frequency: None,
            left_overlaps_target: None,
            right_overlaps_target: None,
            left_targets: None,
            right_targets: None,
        }
    }

    #[test]
    fn test_bedpe_projection_converts_coordinates() {
        let p = aggregated();
        let b = to_bedpe(&p);
        assert_eq!(b.start1, p.left_min_pos - 1);
        assert_eq!(b.end1, p.left_max_pos);
        assert_eq!(b.start2, p.right_min_pos - 1);
        assert_eq!(b.end2, p.right_max_pos);
        assert_eq!(b.name, "112_456_5");
        assert_eq!(b.score, 8);
        assert_eq!(b.strand1, '+');
        assert_eq!(b.strand2, '-');
        // The inclusive bounds are recoverable from the half-open interval.
        assert_eq!(b.start1 + 1, p.left_min_pos);
        assert_eq!(b.end1, p.left_max_pos);
    }

    #[test]
    fn test_bedpe_file_round_trip() {
        let dir = std::env::temp_dir().join("svpileup_bedpe_test");
        std::fs::create_dir_all(&dir).unwrap();
        let agg_path = dir.join("agg.txt");
        let bedpe_path = dir.join("out.bedpe");
        crate::output::write_metrics(agg_path.to_str().unwrap(), &[aggregated()]).unwrap();

        let n = call_to_bedpe(agg_path.to_str().unwrap(), bedpe_path.to_str().unwrap()).unwrap();
        assert_eq!(n, 1);
        let text = std::fs::read_to_string(&bedpe_path).unwrap();
        assert_eq!(text, "chr1\t99\t300\tchr1\t99\t200\t112_456_5\t8\t+\t-\n");
    }
}

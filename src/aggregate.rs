//! Aggregation of nearby breakpoints into candidate events.
//!
//! Breakpoints sharing contig/strand topology are clustered into connected
//! components (neighbors are within `max_dist` on both sides), summed, and
//! optionally annotated with an allele-frequency estimate from a
//! coordinate-indexed alignment file and with target BED overlaps.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::info;

use crate::input::{AlignmentInput, AlignmentRecord};
use crate::output::metric::TableReader;
use crate::output::{AggregatedBreakpointPileup, BreakpointPileup, write_metrics};
use crate::utils::bed::TargetIndex;

/// Tunables for the aggregation pass.
#[derive(Debug, Clone, Copy)]
pub struct AggregateParams {
    /// Maximum per-side distance between neighboring breakpoints.
    pub max_dist: usize,
    /// Bases added on each side of a breakend interval when scanning for
    /// overlapping templates.
    pub flank: usize,
    /// Minimum total evidence before the allele-frequency scan runs.
    pub min_breakpoint_support: u64,
    /// Smallest reportable frequency; also bounds the scan.
    pub min_frequency: f64,
}

impl Default for AggregateParams {
    fn default() -> Self {
        AggregateParams { max_dist: 10, flank: 1000, min_breakpoint_support: 10, min_frequency: 0.001 }
    }
}

/// Reads and validates a breakpoint table produced by the pileup pass.
pub fn read_pileups(path: &str) -> Result<Vec<BreakpointPileup>> {
    let table = TableReader::open(path)?;
    table
        .rows()
        .map(|row| BreakpointPileup::from_row(&row))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Invalid breakpoint table {}", path))
}

/// Groups pileups into connected components of mutual proximity.
///
/// Only pileups sharing `(left_contig, right_contig, left_strand,
/// right_strand)` can be neighbors; within a partition, two pileups are
/// neighbors when both their left and right positions are within
/// `max_dist`. Components are returned in input order of their first
/// member.
pub fn cluster(pileups: &[BreakpointPileup], max_dist: usize) -> Vec<Vec<&BreakpointPileup>> {
    type Topology<'a> = (&'a str, &'a str, char, char);
    let mut partitions: IndexMap<Topology<'_>, Vec<usize>> = IndexMap::new();
    for (i, p) in pileups.iter().enumerate() {
        let key =
            (p.left_contig.as_str(), p.right_contig.as_str(), p.left_strand, p.right_strand);
        partitions.entry(key).or_default().push(i);
    }

    let mut clusters = Vec::new();
    for members in partitions.values() {
        let neighbors = |a: usize, b: usize| {
            let (p, q) = (&pileups[members[a]], &pileups[members[b]]);
            p.id != q.id
                && p.left_pos.abs_diff(q.left_pos) <= max_dist
                && p.right_pos.abs_diff(q.right_pos) <= max_dist
        };
        let mut visited = vec![false; members.len()];
        for start in 0..members.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut queue = VecDeque::from([start]);
            let mut component = Vec::new();
            while let Some(i) = queue.pop_front() {
                component.push(members[i]);
                for j in 0..members.len() {
                    if !visited[j] && neighbors(i, j) {
                        visited[j] = true;
                        queue.push_back(j);
                    }
                }
            }
            component.sort_unstable();
            clusters.push(component.into_iter().map(|i| &pileups[i]).collect());
        }
    }
    clusters
}

fn position_list(positions: impl Iterator<Item = usize>) -> (Vec<usize>, String) {
    let mut positions: Vec<usize> = positions.collect();
    positions.sort_unstable();
    positions.dedup();
    let joined =
        positions.iter().map(usize::to_string).collect::<Vec<_>>().join(",");
    (positions, joined)
}

fn category(cluster: &[&BreakpointPileup]) -> &'static str {
    let first = cluster[0];
    if first.left_contig != first.right_contig {
        "Inter-contig rearrangement"
    } else if first.left_strand != first.right_strand {
        "Intra-contig rearrangement"
    } else {
        "Possible deletion"
    }
}

/// Collapses one cluster into a single aggregated row (no frequency or
/// target annotation yet).
fn aggregate_cluster(cluster: &[&BreakpointPileup]) -> AggregatedBreakpointPileup {
    let mut ids: Vec<String> = cluster.iter().map(|p| p.id.to_string()).collect();
    ids.sort_unstable();
    let (_, left_pileups) = position_list(cluster.iter().map(|p| p.left_pos));
    let (_, right_pileups) = position_list(cluster.iter().map(|p| p.right_pos));
    let first = cluster[0];
    AggregatedBreakpointPileup {
        id: ids.join("_"),
        category: category(cluster).to_string(),
        left_contig: first.left_contig.clone(),
        left_min_pos: cluster.iter().map(|p| p.left_pos).min().unwrap_or(0),
        left_max_pos: cluster.iter().map(|p| p.left_pos).max().unwrap_or(0),
        left_strand: first.left_strand,
        right_contig: first.right_contig.clone(),
        right_min_pos: cluster.iter().map(|p| p.right_pos).min().unwrap_or(0),
        right_max_pos: cluster.iter().map(|p| p.right_pos).max().unwrap_or(0),
        right_strand: first.right_strand,
        split_reads: cluster.iter().map(|p| p.split_reads).sum(),
        read_pairs: cluster.iter().map(|p| p.read_pairs).sum(),
        total: cluster.iter().map(|p| p.total).sum(),
        left_pileups,
        right_pileups,
        left_frequency: None,
        right_frequency: None,
        left_overlaps_target: None,
        right_overlaps_target: None,
        left_targets: None,
        right_targets: None,
    }
}

/// The reference span a record vouches for when testing breakend overlap.
///
/// For an FR pair with both ends on one contig the whole template span
/// counts (the unsequenced insert covers the breakend too); otherwise just
/// the record's own alignment.
fn template_span(record: &AlignmentRecord) -> Option<(usize, usize)> {
    let start = record.alignment_start()?;
    let end = record.alignment_end()?;
    if record.is_paired()
        && record.is_mate_mapped()
        && record.next_ref_id == record.ref_id
        && let Some(mate_start) = record.mate_alignment_start()
    {
        let fr = if record.is_positive_strand() {
            !record.is_mate_positive_strand() && start <= mate_start
        } else {
            record.is_mate_positive_strand() && mate_start <= start
        };
        if fr {
            let mate_end = record.mate_alignment_end().unwrap_or(mate_start);
            return Some((start.min(mate_start), end.max(mate_end)));
        }
    }
    Some((start, end))
}

/// Estimates the fraction of templates over one breakend interval that
/// support the event.
///
/// Returns None when support is below `min_breakpoint_support`, when no
/// overlapping template exists, or when the overlapper count proves the
/// frequency cannot reach `min_frequency` (the scan stops early).
fn side_frequency(
    bam: &mut AlignmentInput,
    contig: &str,
    positions: &[usize],
    min_pos: usize,
    max_pos: usize,
    total: u64,
    params: &AggregateParams,
) -> Result<Option<f64>> {
    if total < params.min_breakpoint_support {
        return Ok(None);
    }
    let scan_start = min_pos.saturating_sub(params.flank).max(1);
    let scan_end = max_pos + params.flank;
    let max_overlappers = if params.min_frequency > 0.0 {
        total as f64 / params.min_frequency
    } else {
        f64::INFINITY
    };

    let mut overlappers: HashSet<String> = HashSet::new();
    for record in bam.query(contig, scan_start, scan_end)? {
        if !record.is_mapped() || record.is_secondary() || record.is_supplementary() {
            continue;
        }
        let Some(name) = record.name() else { continue };
        let Some((span_start, span_end)) = template_span(&record) else { continue };
        if positions.iter().any(|&p| span_start <= p && p <= span_end) {
            overlappers.insert(name.to_string());
            if overlappers.len() as f64 > max_overlappers {
                return Ok(None);
            }
        }
    }
    if overlappers.is_empty() {
        return Ok(None);
    }
    Ok(Some((total as f64 / overlappers.len() as f64).min(1.0)))
}

/// Clusters pileups and computes the optional annotations.
pub fn aggregate_pileups(
    pileups: &[BreakpointPileup],
    params: &AggregateParams,
    mut bam: Option<&mut AlignmentInput>,
    targets: Option<&TargetIndex>,
) -> Result<Vec<AggregatedBreakpointPileup>> {
    let clusters = cluster(pileups, params.max_dist);
    info!("Clustered {} breakpoints into {} events", pileups.len(), clusters.len());

    let mut rows = Vec::with_capacity(clusters.len());
    for cluster in &clusters {
        let mut row = aggregate_cluster(cluster);

        if let Some(bam) = bam.as_deref_mut() {
            let (left_positions, _) = position_list(cluster.iter().map(|p| p.left_pos));
            let (right_positions, _) = position_list(cluster.iter().map(|p| p.right_pos));
            row.left_frequency = side_frequency(
                bam,
                &row.left_contig,
                &left_positions,
                row.left_min_pos,
                row.left_max_pos,
                row.total,
                params,
            )?;
            row.right_frequency = side_frequency(
                bam,
                &row.right_contig,
                &right_positions,
                row.right_min_pos,
                row.right_max_pos,
                row.total,
                params,
            )?;
        }

        if let Some(targets) = targets {
            row.left_overlaps_target =
                Some(targets.overlaps_any(&row.left_contig, row.left_min_pos, row.left_max_pos));
            row.right_overlaps_target =
                Some(targets.overlaps_any(&row.right_contig, row.right_min_pos, row.right_max_pos));
            row.left_targets =
                targets.names_overlapping(&row.left_contig, row.left_min_pos, row.left_max_pos);
            row.right_targets =
                targets.names_overlapping(&row.right_contig, row.right_min_pos, row.right_max_pos);
        }

        rows.push(row);
    }
    Ok(rows)
}

/// The full aggregation pass: read the breakpoint table, cluster, annotate
/// and write the aggregated table. Returns the number of aggregated events.
pub fn call_aggregate(
    input_path: &str,
    output_path: &str,
    params: &AggregateParams,
    bam: Option<&mut AlignmentInput>,
    targets: Option<&TargetIndex>,
) -> Result<usize> {
    let pileups = read_pileups(input_path)?;
    let rows = aggregate_pileups(&pileups, params, bam, targets)?;
    write_metrics(output_path, &rows)?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pileup(
        id: u64,
        left: (&str, usize, char),
        right: (&str, usize, char),
        split_reads: u64,
        read_pairs: u64,
    ) -> BreakpointPileup {
        BreakpointPileup {
            id,
            left_contig: left.0.to_string(),
            left_pos: left.1,
            left_strand: left.2,
            right_contig: right.0.to_string(),
            right_pos: right.1,
            right_strand: right.2,
            split_reads,
            read_pairs,
            total: split_reads + read_pairs,
            left_targets: None,
            right_targets: None,
        }
    }

    #[test]
    fn test_clustering_by_transitive_proximity() {
        // Three pileups chain together through the middle one; the fourth
        // is 201 away on the right side and stays alone.
        let pileups = vec![
            pileup(112, ("chr1", 100, '+'), ("chr1", 200, '+'), 1, 2),
            pileup(456, ("chr1", 200, '+'), ("chr1", 100, '+'), 2, 0),
            pileup(5, ("chr1", 300, '+'), ("chr1", 200, '+'), 0, 3),
            pileup(9, ("chr1", 300, '+'), ("chr1", 401, '+'), 1, 0),
        ];
        let params = AggregateParams { max_dist: 100, ..Default::default() };
        let rows = aggregate_pileups(&pileups, &params, None, None).unwrap();
        assert_eq!(rows.len(), 2);

        let merged = &rows[0];
        assert_eq!(merged.id, "112_456_5");
        assert_eq!(merged.left_min_pos, 100);
        assert_eq!(merged.left_max_pos, 300);
        assert_eq!(merged.right_min_pos, 100);
        assert_eq!(merged.right_max_pos, 200);
        assert_eq!(merged.split_reads, 3);
        assert_eq!(merged.read_pairs, 5);
        assert_eq!(merged.total, 8);
        assert_eq!(merged.left_pileups, "100,200,300");
        assert_eq!(merged.right_pileups, "100,200");
        assert_eq!(merged.category, "Possible deletion");
        assert_eq!(merged.left_frequency, None);

        assert_eq!(rows[1].id, "9");
        assert_eq!(rows[1].total, 1);
    }

    #[test]
    fn test_different_topology_never_clusters() {
        let pileups = vec![
            pileup(0, ("chr1", 100, '+'), ("chr1", 200, '+'), 1, 0),
            pileup(1, ("chr1", 100, '+'), ("chr1", 200, '-'), 1, 0),
            pileup(2, ("chr1", 100, '+'), ("chr2", 200, '+'), 1, 0),
        ];
        let rows = aggregate_pileups(&pileups, &AggregateParams::default(), None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].category, "Possible deletion");
        assert_eq!(rows[1].category, "Intra-contig rearrangement");
        assert_eq!(rows[2].category, "Inter-contig rearrangement");
    }

    #[test]
    fn test_aggregate_total_is_sum_of_constituents() {
        let pileups = vec![
            pileup(0, ("chr1", 100, '+'), ("chr1", 500, '+'), 3, 1),
            pileup(1, ("chr1", 105, '+'), ("chr1", 505, '+'), 0, 2),
        ];
        let rows = aggregate_pileups(&pileups, &AggregateParams::default(), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, pileups.iter().map(|p| p.total).sum::<u64>());
        assert!(rows[0].left_min_pos <= pileups.iter().map(|p| p.left_pos).min().unwrap());
    }

    #[test]
    fn test_max_dist_is_inclusive() {
        let pileups = vec![
            pileup(0, ("chr1", 100, '+'), ("chr1", 500, '+'), 1, 0),
            pileup(1, ("chr1", 110, '+'), ("chr1", 510, '+'), 1, 0),
        ];
        let params = AggregateParams { max_dist: 10, ..Default::default() };
        assert_eq!(aggregate_pileups(&pileups, &params, None, None).unwrap().len(), 1);
        let params = AggregateParams { max_dist: 9, ..Default::default() };
        assert_eq!(aggregate_pileups(&pileups, &params, None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_target_annotation() {
        use crate::utils::bed::read_bed_from_reader;
        use std::io::Cursor;
        let targets = TargetIndex::new(
            read_bed_from_reader(Cursor::new("chr1\t90\t150\tgeneA\n")).unwrap(),
        );
        let pileups = vec![pileup(0, ("chr1", 100, '+'), ("chr1", 500, '+'), 1, 0)];
        let rows =
            aggregate_pileups(&pileups, &AggregateParams::default(), None, Some(&targets)).unwrap();
        assert_eq!(rows[0].left_overlaps_target, Some(true));
        assert_eq!(rows[0].left_targets.as_deref(), Some("geneA"));
        assert_eq!(rows[0].right_overlaps_target, Some(false));
        assert_eq!(rows[0].right_targets, None);
    }

    #[test]
    fn test_template_span_uses_mate_for_fr_pairs() {
        use crate::input::testutil::r1;
        let mut record = r1("q1", 0, 100, "100M", true);
        // Unpaired span is the record itself.
        assert_eq!(template_span(&record), Some((100, 199)));
        // FR pair on one contig spans through the mate.
        record.next_ref_id = 0;
        record.next_pos = 399;
        record.flag |= noodles::sam::alignment::record::Flags::MATE_REVERSE_COMPLEMENTED.bits();
        record.set_tag(*b"MC", "100M");
        assert_eq!(template_span(&record), Some((100, 499)));
        // An RF pair (mate upstream) falls back to the record span.
        record.next_pos = 9;
        assert_eq!(template_span(&record), Some((100, 199)));
    }
}

//! Aligned segments: the mapped sub-ranges of a template in read-sequencing
//! order.
//!
//! Each mapped alignment record yields one segment. Per read end, redundant
//! supplementary alignments are dropped unless they cover enough new read
//! bases; per template, the R1 and R2 chains are stitched together, merging
//! segments where the two reads mapped over each other.

use std::cmp::Ordering;

use anyhow::{Result, bail};
use bitvec::prelude::*;

use crate::input::{AlignmentRecord, CigarKind};
use crate::template::{Template, TemplateView};

/// A 1-based inclusive interval on a contig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenomicRange {
    pub ref_index: usize,
    pub start: usize,
    pub end: usize,
}

impl GenomicRange {
    pub fn new(ref_index: usize, start: usize, end: usize) -> Self {
        debug_assert!(0 < start && start <= end);
        GenomicRange { ref_index, start, end }
    }

    /// True when both ranges sit on the same contig and their intervals
    /// intersect.
    pub fn overlaps(&self, other: &GenomicRange) -> bool {
        self.ref_index == other.ref_index && self.start <= other.end && other.start <= self.end
    }

    /// The smallest range covering both. Callers must check `overlaps` first.
    pub fn union(&self, other: &GenomicRange) -> GenomicRange {
        debug_assert!(self.overlaps(other));
        GenomicRange {
            ref_index: self.ref_index,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl Ord for GenomicRange {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ref_index, self.start, self.end).cmp(&(other.ref_index, other.start, other.end))
    }
}

impl PartialOrd for GenomicRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Which read of the template a segment derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentOrigin {
    ReadOne,
    ReadTwo,
    /// Produced by merging overlapping R1 and R2 mappings.
    Both,
}

impl SegmentOrigin {
    /// True when the two origins can represent opposite ends of a template.
    pub fn is_paired_with(self, other: SegmentOrigin) -> bool {
        self == SegmentOrigin::Both || other == SegmentOrigin::Both || self != other
    }

    /// True when the origins are distinct single-read origins.
    pub fn is_inter_read(self, other: SegmentOrigin) -> bool {
        self != SegmentOrigin::Both && other != SegmentOrigin::Both && self != other
    }
}

/// One mapped portion of a template.
///
/// `read_start`/`read_end` are 1-based inclusive positions in
/// read-sequencing order, independent of the strand the alignment landed on.
/// `recs` holds arena indices of the supporting records; `left` and `right`
/// are the subsets anchored near the range's start and end respectively, and
/// only diverge from `recs` after an R1/R2 merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedSegment {
    pub origin: SegmentOrigin,
    pub read_start: usize,
    pub read_end: usize,
    pub positive_strand: bool,
    pub cigar: Vec<(CigarKind, usize)>,
    pub range: GenomicRange,
    pub recs: Vec<usize>,
    pub left: Vec<usize>,
    pub right: Vec<usize>,
}

impl AlignedSegment {
    /// Builds a segment from one mapped alignment record.
    pub fn from_record(record: &AlignmentRecord, rec_index: usize) -> Result<AlignedSegment> {
        let (Some(start), Some(end)) = (record.alignment_start(), record.alignment_end()) else {
            bail!(
                "Cannot build an aligned segment from unmapped record '{}'",
                record.name().unwrap_or("<unnamed>")
            );
        };
        let (leading_clip, middle, trailing_clip) = clip_profile(record.cigar_ops());
        let (read_start, read_end) = if record.is_positive_strand() {
            (leading_clip + 1, leading_clip + middle)
        } else {
            (trailing_clip + 1, trailing_clip + middle)
        };
        if read_end < read_start {
            bail!(
                "Record '{}' consumes no read bases between its clips",
                record.name().unwrap_or("<unnamed>")
            );
        }
        let origin =
            if record.is_first_of_pair() { SegmentOrigin::ReadOne } else { SegmentOrigin::ReadTwo };
        Ok(AlignedSegment {
            origin,
            read_start,
            read_end,
            positive_strand: record.is_positive_strand(),
            cigar: record.cigar.clone(),
            range: GenomicRange::new(record.ref_id as usize, start, end),
            recs: vec![rec_index],
            left: vec![rec_index],
            right: vec![rec_index],
        })
    }

    /// True when the ranges overlap and the strands agree.
    pub fn strand_overlaps(&self, other: &AlignedSegment) -> bool {
        self.positive_strand == other.positive_strand && self.range.overlaps(&other.range)
    }

    /// Merges two strand-overlapping segments from opposite reads of a pair.
    ///
    /// The merged segment covers the union of the two ranges. Read
    /// coordinates and the CIGAR are reset; downstream only consults the
    /// range, origin and strand. Supporting records are re-partitioned into
    /// the left/right sets by the proximity of their reference starts to the
    /// merged range's endpoints, within `slop` bases.
    pub fn merge(&self, other: &AlignedSegment, slop: usize, records: &[AlignmentRecord]) -> AlignedSegment {
        debug_assert!(self.strand_overlaps(other));
        let range = self.range.union(&other.range);
        let origin =
            if self.origin == other.origin { self.origin } else { SegmentOrigin::Both };

        let mut recs: Vec<usize> = self.recs.iter().chain(other.recs.iter()).copied().collect();
        recs.sort_unstable();
        recs.dedup();

        let near = |rec_index: usize, pos: usize| {
            records[rec_index]
                .alignment_start()
                .is_some_and(|start| start.abs_diff(pos) <= slop)
        };
        let left: Vec<usize> = recs.iter().copied().filter(|&i| near(i, range.start)).collect();
        let right: Vec<usize> = recs.iter().copied().filter(|&i| near(i, range.end)).collect();

        AlignedSegment {
            origin,
            read_start: 1,
            read_end: 1,
            positive_strand: self.positive_strand,
            cigar: Vec::new(),
            range,
            recs,
            left,
            right,
        }
    }
}

/// Splits a CIGAR into (leading clipping, read bases consumed between the
/// clips, trailing clipping). Hard and soft clips both count as clipping.
fn clip_profile(ops: &[(CigarKind, usize)]) -> (usize, usize, usize) {
    let is_clip = |kind: CigarKind| matches!(kind, CigarKind::SoftClip | CigarKind::HardClip);
    let consumes_read = |kind: CigarKind| {
        matches!(
            kind,
            CigarKind::Match
                | CigarKind::Insertion
                | CigarKind::SequenceMatch
                | CigarKind::SequenceMismatch
        )
    };

    let leading: usize =
        ops.iter().take_while(|&&(kind, _)| is_clip(kind)).map(|&(_, len)| len).sum();
    let trailing: usize =
        ops.iter().rev().take_while(|&&(kind, _)| is_clip(kind)).map(|&(_, len)| len).sum();
    let n_leading = ops.iter().take_while(|&&(kind, _)| is_clip(kind)).count();
    let n_trailing = ops.iter().rev().take_while(|&&(kind, _)| is_clip(kind)).count();
    let middle: usize = if n_leading >= ops.len().saturating_sub(n_trailing) {
        0
    } else {
        ops[n_leading..ops.len() - n_trailing]
            .iter()
            .filter(|&&(kind, _)| consumes_read(kind))
            .map(|&(_, len)| len)
            .sum()
    };
    (leading, middle, trailing)
}

/// Full read length implied by an alignment's CIGAR, hard clips included.
fn read_length(ops: &[(CigarKind, usize)]) -> usize {
    let (leading, middle, trailing) = clip_profile(ops);
    leading + middle + trailing
}

/// Builds the segment chain for a single read end.
///
/// The primary is always kept. Supplementaries are visited in ascending
/// `(read_start, read_end)` order (ties keep input order) and each is kept
/// only when it covers at least `min_unique_bases_to_add` read positions not
/// already covered by previously kept segments.
pub fn segments_from(
    primary: AlignedSegment,
    mut supplementals: Vec<AlignedSegment>,
    read_len: usize,
    min_unique_bases_to_add: usize,
) -> Vec<AlignedSegment> {
    let mut covered = bitvec![0; read_len];
    covered[primary.read_start - 1..primary.read_end].fill(true);
    let mut kept = vec![primary];

    supplementals.sort_by_key(|s| (s.read_start, s.read_end));
    for segment in supplementals {
        let span = &covered[segment.read_start - 1..segment.read_end.min(read_len)];
        if span.count_zeros() >= min_unique_bases_to_add {
            covered[segment.read_start - 1..segment.read_end.min(read_len)].fill(true);
            kept.push(segment);
        }
    }

    kept.sort_by_key(|s| (s.read_start, s.read_end));
    kept
}

/// Builds the full template chain from a filtered template.
///
/// R1 and R2 chains are built independently; R2's chain is then reversed and
/// strand-flipped so both reads are expressed in a common template
/// direction (the pair is assumed FR), and the two chains are stitched with
/// [`merge_chains`].
pub fn segments_from_template(
    template: &Template,
    view: &TemplateView,
    min_unique_bases_to_add: usize,
    slop: usize,
) -> Result<Vec<AlignedSegment>> {
    let chain_for = |primary: Option<usize>, supplementals: &[usize]| -> Result<Vec<AlignedSegment>> {
        let Some(primary_index) = primary else {
            return Ok(Vec::new());
        };
        let primary_segment = AlignedSegment::from_record(&template.records[primary_index], primary_index)?;
        let mut read_len = read_length(template.records[primary_index].cigar_ops());
        let mut supplementary_segments = Vec::with_capacity(supplementals.len());
        for &idx in supplementals {
            supplementary_segments.push(AlignedSegment::from_record(&template.records[idx], idx)?);
            read_len = read_len.max(read_length(template.records[idx].cigar_ops()));
        }
        Ok(segments_from(primary_segment, supplementary_segments, read_len, min_unique_bases_to_add))
    };

    let r1_chain = chain_for(view.r1, &view.r1_supplementals)?;
    let mut r2_chain = chain_for(view.r2, &view.r2_supplementals)?;

    if r1_chain.is_empty() && r2_chain.is_empty() {
        bail!("Template '{}' has no mapped primary alignment", template.name);
    }
    if r1_chain.is_empty() {
        return Ok(r2_chain);
    }
    if r2_chain.is_empty() {
        return Ok(r1_chain);
    }

    // Express R2 in the template's sequencing direction: last-sequenced
    // segment first, strands flipped.
    r2_chain.reverse();
    for segment in &mut r2_chain {
        segment.positive_strand = !segment.positive_strand;
    }

    Ok(merge_chains(r1_chain, r2_chain, slop, &template.records))
}

/// Stitches the R1 chain to the (reversed, strand-flipped) R2 chain.
///
/// Starting at depth one, the last `k` R1 segments are compared to the
/// first `k` R2 segments pairwise; at the first depth where every pair
/// strand-overlaps, each pair is merged and the chains are joined around the
/// merged middle. When no depth fits within both chains, the chains are
/// concatenated unmerged.
pub fn merge_chains(
    r1: Vec<AlignedSegment>,
    r2: Vec<AlignedSegment>,
    slop: usize,
    records: &[AlignmentRecord],
) -> Vec<AlignedSegment> {
    let (n1, n2) = (r1.len(), r2.len());
    let mut k = 1;
    while k <= n1 && k <= n2 {
        let all_overlap = (0..k).all(|i| r1[n1 - k + i].strand_overlaps(&r2[i]));
        if all_overlap {
            let mut chain = Vec::with_capacity(n1 + n2 - k);
            chain.extend_from_slice(&r1[..n1 - k]);
            for i in 0..k {
                chain.push(r1[n1 - k + i].merge(&r2[i], slop, records));
            }
            chain.extend_from_slice(&r2[k..]);
            return chain;
        }
        k += 1;
    }
    let mut chain = r1;
    chain.extend(r2);
    chain
}

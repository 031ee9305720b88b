//! Breakpoints, the pairwise detector that finds them in a segment chain,
//! and the process-lifetime tracker that counts their supporting evidence.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::input::SequenceDictionary;
use crate::segment::AlignedSegment;

/// The kind of evidence supporting a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceType {
    /// Both segments come from the same read.
    SplitRead,
    /// The segments come from different reads of one template.
    ReadPair,
}

impl EvidenceType {
    pub fn snake_name(self) -> &'static str {
        match self {
            EvidenceType::SplitRead => "split_read",
            EvidenceType::ReadPair => "read_pair",
        }
    }
}

/// A canonical pair of breakends.
///
/// Positions are 1-based inclusive. The canonical form has the lesser
/// `(ref_index, pos)` on the left, ties preferring a positive left strand;
/// [`Breakpoint::canonicalize`] is idempotent and reversal is an involution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    pub left_ref_index: usize,
    pub left_pos: usize,
    pub left_positive: bool,
    pub right_ref_index: usize,
    pub right_pos: usize,
    pub right_positive: bool,
}

impl Breakpoint {
    /// Swaps the breakends and negates both strands.
    pub fn reversed(&self) -> Breakpoint {
        Breakpoint {
            left_ref_index: self.right_ref_index,
            left_pos: self.right_pos,
            left_positive: !self.right_positive,
            right_ref_index: self.left_ref_index,
            right_pos: self.left_pos,
            right_positive: !self.left_positive,
        }
    }

    fn order_key(&self) -> (usize, usize, bool, usize, usize, bool) {
        (
            self.left_ref_index,
            self.left_pos,
            !self.left_positive,
            self.right_ref_index,
            self.right_pos,
            !self.right_positive,
        )
    }

    pub fn is_canonical(&self) -> bool {
        self.order_key() <= self.reversed().order_key()
    }

    /// Returns the canonical representation and whether this one already was
    /// canonical.
    pub fn canonicalize(&self) -> (Breakpoint, bool) {
        if self.is_canonical() { (*self, true) } else { (self.reversed(), false) }
    }

    /// Ordering that clusters paired events: left contig, right contig, then
    /// positions, then strands.
    pub fn paired_ordering(&self, other: &Breakpoint) -> Ordering {
        let key = |bp: &Breakpoint| {
            (
                bp.left_ref_index,
                bp.right_ref_index,
                bp.left_pos,
                bp.right_pos,
                !bp.left_positive,
                !bp.right_positive,
            )
        };
        key(self).cmp(&key(other))
    }
}

/// One breakpoint observation from a single template, with the records
/// sitting on each side of the junction.
///
/// `from` holds the records of the sequencing-order-earlier segment,
/// `into` those of the later one; `from_is_left` records which side of the
/// canonical breakpoint the `from` records ended up on.
#[derive(Debug, Clone)]
pub struct BreakpointEvidence {
    pub breakpoint: Breakpoint,
    pub evidence: EvidenceType,
    pub from: Vec<usize>,
    pub into: Vec<usize>,
    pub from_is_left: bool,
}

impl BreakpointEvidence {
    /// Builds the evidence for an ordered segment pair `from -> into`.
    ///
    /// The left breakend takes the position where the template leaves
    /// `from` (its range end on the forward strand, start on the reverse);
    /// the right breakend takes the position where it enters `into`. The
    /// records crossing out of `from` are those anchored on the far side of
    /// its range in the direction of travel, and symmetrically for `into`.
    pub fn from_segments(
        from: &AlignedSegment,
        into: &AlignedSegment,
        evidence: EvidenceType,
    ) -> BreakpointEvidence {
        let raw = Breakpoint {
            left_ref_index: from.range.ref_index,
            left_pos: if from.positive_strand { from.range.end } else { from.range.start },
            left_positive: from.positive_strand,
            right_ref_index: into.range.ref_index,
            right_pos: if into.positive_strand { into.range.start } else { into.range.end },
            right_positive: into.positive_strand,
        };
        let (breakpoint, from_is_left) = raw.canonicalize();
        let from_recs =
            if from.positive_strand { from.right.clone() } else { from.left.clone() };
        let into_recs =
            if into.positive_strand { into.left.clone() } else { into.right.clone() };
        BreakpointEvidence {
            breakpoint,
            evidence,
            from: from_recs,
            into: into_recs,
            from_is_left,
        }
    }
}

/// Thresholds for the pairwise breakpoint scan.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Maximum reference gap between segments of the same read.
    pub max_within_read_distance: usize,
    /// Maximum reference gap between segments from different reads of a pair.
    pub max_read_pair_inner_distance: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        DetectorParams { max_within_read_distance: 100, max_read_pair_inner_distance: 1000 }
    }
}

/// Reference-coordinate gap between two segments: from the end of whichever
/// starts first to the start of the other. Negative when they overlap.
fn inner_distance(s1: &AlignedSegment, s2: &AlignedSegment) -> isize {
    if s1.range.start <= s2.range.start {
        s2.range.start as isize - s1.range.end as isize
    } else {
        s1.range.start as isize - s2.range.end as isize
    }
}

/// True when an adjacent segment pair on the same contig is discontiguous.
fn intra_contig_break(s1: &AlignedSegment, s2: &AlignedSegment, params: &DetectorParams) -> bool {
    if s1.positive_strand != s2.positive_strand {
        return true;
    }
    // The template must keep moving in its direction of travel.
    if s1.positive_strand && s2.range.start < s1.range.end {
        return true;
    }
    if !s1.positive_strand && s1.range.start < s2.range.start {
        return true;
    }
    let max_inner_distance = if s1.origin.is_inter_read(s2.origin) {
        params.max_read_pair_inner_distance
    } else {
        params.max_within_read_distance
    };
    inner_distance(s1, s2) > max_inner_distance as isize
}

/// Walks the chain pairwise and emits one evidence per discontiguous pair.
///
/// Intra-contig discontinuities on circular contigs are suppressed: a gap
/// there may simply wrap around the origin (e.g. chrM).
pub fn detect(
    chain: &[AlignedSegment],
    params: &DetectorParams,
    dict: &SequenceDictionary,
) -> Vec<BreakpointEvidence> {
    let mut evidence = Vec::new();
    for pair in chain.windows(2) {
        let (s1, s2) = (&pair[0], &pair[1]);
        let fires = if s1.range.ref_index != s2.range.ref_index {
            true
        } else if dict.is_circular(s1.range.ref_index) {
            false
        } else {
            intra_contig_break(s1, s2, params)
        };
        if fires {
            let kind = if s1.origin.is_inter_read(s2.origin) {
                EvidenceType::ReadPair
            } else {
                EvidenceType::SplitRead
            };
            evidence.push(BreakpointEvidence::from_segments(s1, s2, kind));
        }
    }
    evidence
}

/// Per-breakpoint evidence counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakpointCounts {
    pub id: u64,
    pub split_reads: u64,
    pub read_pairs: u64,
}

impl BreakpointCounts {
    pub fn total(&self) -> u64 {
        self.split_reads + self.read_pairs
    }
}

/// Process-lifetime mapping from canonical breakpoint to id and counts.
///
/// Ids are assigned monotonically on first observation, so they are stable
/// for a given template consumption order.
#[derive(Debug, Default)]
pub struct BreakpointTracker {
    counts: IndexMap<Breakpoint, BreakpointCounts>,
}

impl BreakpointTracker {
    pub fn new() -> Self {
        BreakpointTracker::default()
    }

    /// Counts one observation and returns the breakpoint's id.
    pub fn count(&mut self, breakpoint: Breakpoint, evidence: EvidenceType) -> u64 {
        let next_id = self.counts.len() as u64;
        let entry = self
            .counts
            .entry(breakpoint)
            .or_insert(BreakpointCounts { id: next_id, split_reads: 0, read_pairs: 0 });
        match evidence {
            EvidenceType::SplitRead => entry.split_reads += 1,
            EvidenceType::ReadPair => entry.read_pairs += 1,
        }
        entry.id
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Consumes the tracker, yielding breakpoints in paired ordering.
    pub fn into_sorted(self) -> Vec<(Breakpoint, BreakpointCounts)> {
        let mut entries: Vec<_> = self.counts.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.paired_ordering(b));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::testutil::{r1, r1_supp, r2};
    use crate::segment::segments_from_template;
    use crate::template::Template;
    use noodles::sam;
    use noodles::sam::header::record::value::Map;
    use noodles::sam::header::record::value::map::ReferenceSequence;
    use std::num::NonZeroUsize;

    fn dict(n: usize) -> SequenceDictionary {
        let mut builder = sam::Header::builder();
        for i in 0..n {
            builder = builder.add_reference_sequence(
                format!("chr{}", i + 1),
                Map::<ReferenceSequence>::new(NonZeroUsize::try_from(10_000_000).unwrap()),
            );
        }
        SequenceDictionary::from_sam_header(&builder.build())
    }

    fn chain_of(records: Vec<crate::input::AlignmentRecord>) -> Vec<AlignedSegment> {
        let template = Template::from_records("q1".to_string(), records);
        let view = template.filter(0, 0).unwrap();
        segments_from_template(&template, &view, 20, 5).unwrap()
    }

    fn bp(
        left: (usize, usize, bool),
        right: (usize, usize, bool),
    ) -> Breakpoint {
        Breakpoint {
            left_ref_index: left.0,
            left_pos: left.1,
            left_positive: left.2,
            right_ref_index: right.0,
            right_pos: right.1,
            right_positive: right.2,
        }
    }

    #[test]
    fn test_reversal_is_involution_and_canonicalize_idempotent() {
        let b = bp((1, 500, false), (0, 100, true));
        assert_eq!(b.reversed().reversed(), b);
        let (canonical, was_canonical) = b.canonicalize();
        assert!(!was_canonical);
        assert_eq!(canonical, bp((0, 100, false), (1, 500, true)));
        assert_eq!(canonical.canonicalize(), (canonical, true));
    }

    #[test]
    fn test_canonical_tie_prefers_positive_left() {
        let b = bp((0, 100, false), (0, 100, false));
        let (canonical, _) = b.canonicalize();
        assert!(canonical.left_positive);
        assert_eq!(canonical, bp((0, 100, true), (0, 100, true)));
    }

    #[test]
    fn test_plain_fr_pair_yields_no_breakpoint() {
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", true), r2("q1", 0, 250, "100M", false)]);
        let found = detect(&chain, &DetectorParams::default(), &dict(2));
        assert!(found.is_empty());
    }

    #[test]
    fn test_tandem_read_pair_same_strand() {
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", true), r2("q1", 0, 250, "100M", true)]);
        let found = detect(&chain, &DetectorParams::default(), &dict(2));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].evidence, EvidenceType::ReadPair);
        assert_eq!(found[0].breakpoint, bp((0, 199, true), (0, 349, false)));
        assert!(found[0].from_is_left);
    }

    #[test]
    fn test_rf_pair() {
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", false), r2("q1", 0, 250, "100M", true)]);
        let found = detect(&chain, &DetectorParams::default(), &dict(2));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].breakpoint, bp((0, 100, false), (0, 349, false)));
        assert_eq!(found[0].evidence, EvidenceType::ReadPair);
    }

    #[test]
    fn test_inter_contig_pair() {
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", true), r2("q1", 1, 300, "100M", false)]);
        let found = detect(&chain, &DetectorParams::default(), &dict(2));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].breakpoint, bp((0, 199, true), (1, 300, true)));
        assert_eq!(found[0].evidence, EvidenceType::ReadPair);
    }

    #[test]
    fn test_split_read_with_mate() {
        let chain = chain_of(vec![
            r1("q1", 0, 100, "50M50S", true),
            r1_supp("q1", 6, 800, "50S50M", true),
            r2("q1", 6, 850, "100M", false),
        ]);
        let found = detect(&chain, &DetectorParams::default(), &dict(7));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].evidence, EvidenceType::SplitRead);
        assert_eq!(found[0].breakpoint, bp((0, 149, true), (6, 800, true)));
    }

    #[test]
    fn test_multi_break_template() {
        let chain = chain_of(vec![
            r1("q1", 0, 100, "30M70S", true),
            r1_supp("q1", 1, 500, "30S40M30S", false),
            r1_supp("q1", 2, 900, "70S30M", true),
            r2("q1", 2, 1200, "100M", false),
        ]);
        let found = detect(&chain, &DetectorParams::default(), &dict(3));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].breakpoint, bp((0, 129, true), (1, 539, false)));
        assert_eq!(found[0].evidence, EvidenceType::SplitRead);
        assert_eq!(found[1].breakpoint, bp((1, 500, false), (2, 900, true)));
        assert_eq!(found[1].evidence, EvidenceType::SplitRead);
    }

    #[test]
    fn test_single_segment_yields_nothing() {
        let chain = chain_of(vec![r1("q1", 0, 100, "100M", true)]);
        assert!(detect(&chain, &DetectorParams::default(), &dict(1)).is_empty());
    }

    #[test]
    fn test_duplication_shape_flips_both_strands() {
        // Overlapping same-strand split: canonicalization lands both
        // breakends on the negative strand at the range endpoints.
        let chain = chain_of(vec![
            r1("q1", 0, 100, "50M50S", true),
            r1_supp("q1", 0, 80, "50S50M", true),
        ]);
        let found = detect(&chain, &DetectorParams::default(), &dict(1));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].breakpoint, bp((0, 80, false), (0, 149, false)));
        assert!(!found[0].from_is_left);
    }

    #[test]
    fn test_strand_flip_with_zero_gap() {
        // The supplementary is on the negative strand, so its trailing clip
        // leads in sequencing order: it covers read 51..100.
        let chain = chain_of(vec![
            r1("q1", 0, 100, "50M50S", true),
            r1_supp("q1", 0, 150, "50M50S", false),
        ]);
        let found = detect(&chain, &DetectorParams::default(), &dict(1));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].evidence, EvidenceType::SplitRead);
    }

    #[test]
    fn test_inner_distance_threshold_is_strict() {
        let params = DetectorParams::default();
        // Gap of exactly 100 between split segments: no breakpoint.
        let chain = chain_of(vec![
            r1("q1", 0, 100, "50M50S", true),
            r1_supp("q1", 0, 249, "50S50M", true),
        ]);
        assert!(detect(&chain, &params, &dict(1)).is_empty());
        // One more base fires.
        let chain = chain_of(vec![
            r1("q1", 0, 100, "50M50S", true),
            r1_supp("q1", 0, 250, "50S50M", true),
        ]);
        assert_eq!(detect(&chain, &params, &dict(1)).len(), 1);
    }

    #[test]
    fn test_read_pair_threshold_applies_between_reads() {
        let params = DetectorParams::default();
        // Gap of 801 between R1 and R2: inside the read-pair limit.
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", true), r2("q1", 0, 1000, "100M", false)]);
        assert!(detect(&chain, &params, &dict(1)).is_empty());
        // Gap of 1002 exceeds it.
        let chain =
            chain_of(vec![r1("q1", 0, 100, "100M", true), r2("q1", 0, 1201, "100M", false)]);
        assert_eq!(detect(&chain, &params, &dict(1)).len(), 1);
    }

    #[test]
    fn test_circular_contig_suppresses_intra_contig_break() {
        let mut builder = sam::Header::builder();
        builder = builder.add_reference_sequence(
            "chrM",
            Map::<ReferenceSequence>::builder()
                .set_length(NonZeroUsize::try_from(16_569).unwrap())
                .insert("TP".parse().unwrap(), "circular")
                .build()
                .unwrap(),
        );
        let circular_dict = SequenceDictionary::from_sam_header(&builder.build());
        assert!(circular_dict.is_circular(0));

        // A split wrapping the origin: suppressed on the circular contig.
        let chain = chain_of(vec![
            r1("q1", 0, 16_000, "50M50S", true),
            r1_supp("q1", 0, 10, "50S50M", true),
        ]);
        assert!(detect(&chain, &DetectorParams::default(), &circular_dict).is_empty());
        // The same shape on a linear contig fires.
        assert_eq!(detect(&chain, &DetectorParams::default(), &dict(1)).len(), 1);
    }

    #[test]
    fn test_tracker_assigns_monotonic_ids_and_counts() {
        let mut tracker = BreakpointTracker::new();
        let a = bp((0, 199, true), (0, 349, false));
        let b = bp((0, 100, false), (1, 500, true));
        assert_eq!(tracker.count(a, EvidenceType::ReadPair), 0);
        assert_eq!(tracker.count(b, EvidenceType::SplitRead), 1);
        assert_eq!(tracker.count(a, EvidenceType::SplitRead), 0);
        let entries = tracker.into_sorted();
        assert_eq!(entries.len(), 2);
        // Equal left refs, so the chr1/chr1 event sorts before chr1/chr2.
        assert_eq!(entries[0].0, a);
        assert_eq!(entries[0].1.split_reads, 1);
        assert_eq!(entries[0].1.read_pairs, 1);
        assert_eq!(entries[0].1.total(), 2);
        assert_eq!(entries[1].0, b);
        assert_eq!(entries[1].1.id, 1);
    }
}

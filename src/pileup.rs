//! The pileup driver: walks templates, accumulates breakpoint evidence and
//! writes the breakpoint table plus an annotated copy of the input.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use log::{info, warn};

use crate::breakpoint::{BreakpointEvidence, BreakpointTracker, DetectorParams, detect};
use crate::input::{AlignmentInput, SequenceDictionary};
use crate::output::bam::AlignmentSink;
use crate::output::{BreakpointPileup, write_metrics};
use crate::segment::segments_from_template;
use crate::template::{Template, TemplateIterator};
use crate::utils::bed::TargetIndex;

/// Tag added to every record that contributed to a breakpoint.
pub const BREAKPOINT_TAG: [u8; 2] = *b"be";

/// How the target BED constrains which breakpoints are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetsBedRequirement {
    /// Keep everything; targets only annotate the table.
    AnnotateOnly,
    /// Keep a breakpoint only when at least one breakend overlaps a target.
    OverlapAny,
    /// Keep a breakpoint only when both breakends overlap targets.
    OverlapBoth,
}

/// Tunables for the pileup pass.
#[derive(Debug, Clone, Copy)]
pub struct PileupParams {
    pub max_read_pair_inner_distance: usize,
    pub max_aligned_segment_inner_distance: usize,
    pub min_primary_mapping_quality: u8,
    pub min_supplementary_mapping_quality: u8,
    pub min_unique_bases_to_add: usize,
    pub slop: usize,
    pub targets_requirement: TargetsBedRequirement,
}

impl Default for PileupParams {
    fn default() -> Self {
        PileupParams {
            max_read_pair_inner_distance: 1000,
            max_aligned_segment_inner_distance: 100,
            min_primary_mapping_quality: 30,
            min_supplementary_mapping_quality: 18,
            min_unique_bases_to_add: 20,
            slop: 5,
            targets_requirement: TargetsBedRequirement::AnnotateOnly,
        }
    }
}

impl PileupParams {
    fn detector(&self) -> DetectorParams {
        DetectorParams {
            max_within_read_distance: self.max_aligned_segment_inner_distance,
            max_read_pair_inner_distance: self.max_read_pair_inner_distance,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PileupSummary {
    pub templates: u64,
    pub templates_with_evidence: u64,
    pub breakpoints: usize,
}

fn breakend_on_target(
    targets: &TargetIndex,
    dict: &SequenceDictionary,
    ref_index: usize,
    pos: usize,
) -> bool {
    dict.name(ref_index).is_some_and(|contig| targets.overlaps_any(contig, pos, pos))
}

/// Drops evidence whose breakends miss the targets, per the requirement.
fn apply_target_requirement(
    evidence: Vec<BreakpointEvidence>,
    targets: Option<&TargetIndex>,
    requirement: TargetsBedRequirement,
    dict: &SequenceDictionary,
) -> Vec<BreakpointEvidence> {
    let Some(targets) = targets else {
        return evidence;
    };
    if requirement == TargetsBedRequirement::AnnotateOnly {
        return evidence;
    }
    evidence
        .into_iter()
        .filter(|ev| {
            let bp = &ev.breakpoint;
            let left = breakend_on_target(targets, dict, bp.left_ref_index, bp.left_pos);
            let right = breakend_on_target(targets, dict, bp.right_ref_index, bp.right_pos);
            match requirement {
                TargetsBedRequirement::AnnotateOnly => true,
                TargetsBedRequirement::OverlapAny => left || right,
                TargetsBedRequirement::OverlapBoth => left && right,
            }
        })
        .collect()
}

/// Tags every record participating in committed evidence with one
/// `<id>;<side>;<role>;<kind>` element per (evidence, role) it appears in.
fn annotate_records(template: &mut Template, committed: &[(u64, BreakpointEvidence)]) {
    for idx in 0..template.records.len() {
        let mut parts: Vec<String> = Vec::new();
        for (id, ev) in committed {
            if ev.from.contains(&idx) {
                let side = if ev.from_is_left { "left" } else { "right" };
                parts.push(format!("{};{};from;{}", id, side, ev.evidence.snake_name()));
            }
            if ev.into.contains(&idx) {
                let side = if ev.from_is_left { "right" } else { "left" };
                parts.push(format!("{};{};into;{}", id, side, ev.evidence.snake_name()));
            }
        }
        if !parts.is_empty() {
            template.records[idx].set_tag(BREAKPOINT_TAG, &parts.join(","));
        }
    }
}

/// Runs detection for one template and commits its evidence to the tracker.
///
/// Tracker updates happen only after detection has fully succeeded, so a
/// malformed template never leaves partial counts behind. Returns true when
/// the template contributed evidence.
pub fn process_template(
    template: &mut Template,
    params: &PileupParams,
    dict: &SequenceDictionary,
    targets: Option<&TargetIndex>,
    tracker: &mut BreakpointTracker,
) -> bool {
    let Some(view) =
        template.filter(params.min_primary_mapping_quality, params.min_supplementary_mapping_quality)
    else {
        return false;
    };
    let chain = match segments_from_template(template, &view, params.min_unique_bases_to_add, params.slop)
    {
        Ok(chain) => chain,
        Err(e) => {
            warn!("Skipping template '{}': {}", template.name, e);
            return false;
        }
    };
    let evidence = detect(&chain, &params.detector(), dict);
    let evidence = apply_target_requirement(evidence, targets, params.targets_requirement, dict);
    if evidence.is_empty() {
        return false;
    }
    let committed: Vec<(u64, BreakpointEvidence)> = evidence
        .into_iter()
        .map(|ev| (tracker.count(ev.breakpoint, ev.evidence), ev))
        .collect();
    annotate_records(template, &committed);
    true
}

/// Converts the tracker's contents into table rows, in paired ordering.
pub fn pileup_rows(
    tracker: BreakpointTracker,
    dict: &SequenceDictionary,
    targets: Option<&TargetIndex>,
) -> Result<Vec<BreakpointPileup>> {
    let strand = |positive: bool| if positive { '+' } else { '-' };
    tracker
        .into_sorted()
        .into_iter()
        .map(|(bp, counts)| {
            let left_contig = dict
                .name(bp.left_ref_index)
                .with_context(|| format!("Unknown reference index {}", bp.left_ref_index))?
                .to_string();
            let right_contig = dict
                .name(bp.right_ref_index)
                .with_context(|| format!("Unknown reference index {}", bp.right_ref_index))?
                .to_string();
            let left_targets = targets
                .and_then(|t| t.names_overlapping(&left_contig, bp.left_pos, bp.left_pos));
            let right_targets = targets
                .and_then(|t| t.names_overlapping(&right_contig, bp.right_pos, bp.right_pos));
            Ok(BreakpointPileup {
                id: counts.id,
                left_contig,
                left_pos: bp.left_pos,
                left_strand: strand(bp.left_positive),
                right_contig,
                right_pos: bp.right_pos,
                right_strand: strand(bp.right_positive),
                split_reads: counts.split_reads,
                read_pairs: counts.read_pairs,
                total: counts.total(),
                left_targets,
                right_targets,
            })
        })
        .collect()
}

/// The full pileup pass: reads query-grouped input, writes
/// `<output>.txt` (the breakpoint table) and `<output>.bam` (the annotated
/// alignments).
pub fn call_pileup(
    input: &mut AlignmentInput,
    output_prefix: &str,
    params: &PileupParams,
    targets: Option<&TargetIndex>,
) -> Result<PileupSummary> {
    let dict = input.dict.clone();
    if dict.is_empty() {
        bail!("Input has no sequence dictionary (@SQ lines)");
    }
    if let Some(targets) = targets {
        for contig in targets.contigs() {
            if dict.ref_index(contig).is_none() {
                bail!("Target contig '{}' is not in the sequence dictionary", contig);
            }
        }
    }
    if targets.is_none() && params.targets_requirement != TargetsBedRequirement::AnnotateOnly {
        bail!("--targets-bed is required for requirement {:?}", params.targets_requirement);
    }

    let mut sink =
        AlignmentSink::create(&format!("{}.bam", output_prefix), input.sam_header().clone())?;
    let mut tracker = BreakpointTracker::new();
    let mut summary = PileupSummary::default();

    info!("Scanning templates for breakpoint evidence...");
    for template in TemplateIterator::new(input) {
        let mut template = template?;
        summary.templates += 1;
        if summary.templates % 100_000 == 0 {
            info!(
                "Processed {} templates, {} breakpoints so far",
                summary.templates,
                tracker.len()
            );
        }
        if template.is_unmapped() {
            warn!("Skipping template '{}': no mapped records", template.name);
        } else if process_template(&mut template, params, &dict, targets, &mut tracker) {
            summary.templates_with_evidence += 1;
        }
        for record in &template.records {
            sink.write(record)?;
        }
    }

    summary.breakpoints = tracker.len();
    let rows = pileup_rows(tracker, &dict, targets)?;
    write_metrics(&format!("{}.txt", output_prefix), &rows)?;
    sink.finish()?;

    info!(
        "Done: {} templates, {} with evidence, {} distinct breakpoints",
        summary.templates, summary.templates_with_evidence, summary.breakpoints
    );
    Ok(summary)
}

//! Grouping of alignment records into templates by query name.
//!
//! A template holds every record sharing one query name: the primary R1 and
//! R2, their supplementary alignments, and anything else (secondaries,
//! unmapped mates). Records live in a single arena per template; the rest of
//! the crate refers to them by index so a record can sit in several
//! collections without being copied.

use anyhow::{Result, bail};
use log::warn;

use crate::input::{AlignmentInput, AlignmentRecord};

/// All records for one query name, grouped by role.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub name: String,
    /// Record arena, in input order.
    pub records: Vec<AlignmentRecord>,
    pub r1: Option<usize>,
    pub r2: Option<usize>,
    pub r1_supplementals: Vec<usize>,
    pub r2_supplementals: Vec<usize>,
    /// Secondary alignments and anything else that takes no part in
    /// breakpoint detection but is still mirrored to the output.
    pub others: Vec<usize>,
}

impl Template {
    /// Organizes the records of one query-name group.
    ///
    /// Extra primaries (e.g. from malformed flags) are demoted to `others`
    /// with a warning rather than rejected, so the group can still be
    /// mirrored to the output.
    pub fn from_records(name: String, records: Vec<AlignmentRecord>) -> Self {
        let mut template = Template { name, records, ..Default::default() };
        for idx in 0..template.records.len() {
            let rec = &template.records[idx];
            if rec.is_secondary() {
                template.others.push(idx);
            } else if rec.is_supplementary() {
                if rec.is_first_of_pair() {
                    template.r1_supplementals.push(idx);
                } else {
                    template.r2_supplementals.push(idx);
                }
            } else if rec.is_first_of_pair() {
                if template.r1.is_none() {
                    template.r1 = Some(idx);
                } else {
                    warn!("Template '{}' has more than one primary R1", template.name);
                    template.others.push(idx);
                }
            } else if template.r2.is_none() {
                template.r2 = Some(idx);
            } else {
                warn!("Template '{}' has more than one primary R2", template.name);
                template.others.push(idx);
            }
        }
        template
    }

    /// True when no record in the template is mapped.
    pub fn is_unmapped(&self) -> bool {
        !self.records.iter().any(|r| r.is_mapped())
    }

    /// Applies the mapping-quality filter, returning the indices of the
    /// records that take part in segment building.
    ///
    /// A primary survives when it is mapped with `mapq >= min_primary_mapq`.
    /// When neither primary survives the whole template is dropped. A
    /// surviving end keeps its supplementaries that are mapped with
    /// `mapq >= min_supplementary_mapq`; the other end's supplementaries are
    /// dropped along with its primary.
    pub fn filter(&self, min_primary_mapq: u8, min_supplementary_mapq: u8) -> Option<TemplateView> {
        let primary_ok = |idx: Option<usize>| {
            idx.filter(|&i| {
                let rec = &self.records[i];
                rec.is_mapped() && rec.mapq >= min_primary_mapq
            })
        };
        let r1 = primary_ok(self.r1);
        let r2 = primary_ok(self.r2);
        if r1.is_none() && r2.is_none() {
            return None;
        }

        let supplementary_ok = |indices: &[usize], keep: bool| {
            if !keep {
                return Vec::new();
            }
            indices
                .iter()
                .copied()
                .filter(|&i| {
                    let rec = &self.records[i];
                    rec.is_mapped() && rec.mapq >= min_supplementary_mapq
                })
                .collect()
        };

        Some(TemplateView {
            r1,
            r2,
            r1_supplementals: supplementary_ok(&self.r1_supplementals, r1.is_some()),
            r2_supplementals: supplementary_ok(&self.r2_supplementals, r2.is_some()),
        })
    }
}

/// The filtered subset of a template used for segment building.
#[derive(Debug, Clone, Default)]
pub struct TemplateView {
    pub r1: Option<usize>,
    pub r2: Option<usize>,
    pub r1_supplementals: Vec<usize>,
    pub r2_supplementals: Vec<usize>,
}

/// Iterates templates from a query-grouped alignment stream.
///
/// Consecutive records sharing a name form one template; the input must be
/// queryname-grouped (e.g. `samtools collate` output or aligner output).
pub struct TemplateIterator<'a> {
    input: &'a mut AlignmentInput,
    pending: Option<AlignmentRecord>,
    done: bool,
}

impl<'a> TemplateIterator<'a> {
    pub fn new(input: &'a mut AlignmentInput) -> Self {
        TemplateIterator { input, pending: None, done: false }
    }

    fn next_template(&mut self) -> Result<Option<Template>> {
        let first = match self.pending.take() {
            Some(rec) => rec,
            None => match self.input.read_record()? {
                Some(rec) => rec,
                None => return Ok(None),
            },
        };
        let Some(name) = first.name().map(str::to_string) else {
            bail!("Record without a query name in query-grouped input");
        };

        let mut records = vec![first];
        while let Some(rec) = self.input.read_record()? {
            if rec.name() == Some(name.as_str()) {
                records.push(rec);
            } else {
                self.pending = Some(rec);
                break;
            }
        }
        Ok(Some(Template::from_records(name, records)))
    }
}

impl Iterator for TemplateIterator<'_> {
    type Item = Result<Template>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_template() {
            Ok(Some(template)) => Some(Ok(template)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::testutil::{r1, r1_supp, r2, rec};
    use noodles::sam::alignment::record::Flags;

    #[test]
    fn test_from_records_assigns_roles() {
        let records = vec![
            r1("q1", 0, 100, "100M", true),
            r2("q1", 0, 250, "100M", false),
            r1_supp("q1", 1, 800, "50S50M", true),
            rec("q1", 0, 400, "100M", true, Flags::SEGMENTED | Flags::LAST_SEGMENT | Flags::SECONDARY, 3),
        ];
        let t = Template::from_records("q1".to_string(), records);
        assert_eq!(t.r1, Some(0));
        assert_eq!(t.r2, Some(1));
        assert_eq!(t.r1_supplementals, vec![2]);
        assert_eq!(t.r2_supplementals, Vec::<usize>::new());
        assert_eq!(t.others, vec![3]);
    }

    #[test]
    fn test_unpaired_read_is_r1() {
        let records = vec![rec("q1", 0, 100, "100M", true, Flags::empty(), 60)];
        let t = Template::from_records("q1".to_string(), records);
        assert_eq!(t.r1, Some(0));
        assert!(t.r2.is_none());
    }

    #[test]
    fn test_filter_drops_low_mapq_primary_and_its_supplementaries() {
        let mut low_r1 = r1("q1", 0, 100, "100M", true);
        low_r1.mapq = 10;
        let records = vec![
            low_r1,
            r2("q1", 0, 250, "100M", false),
            r1_supp("q1", 1, 800, "50S50M", true),
        ];
        let t = Template::from_records("q1".to_string(), records);
        let view = t.filter(30, 18).unwrap();
        assert!(view.r1.is_none());
        assert_eq!(view.r2, Some(1));
        assert!(view.r1_supplementals.is_empty());
    }

    #[test]
    fn test_filter_drops_template_when_no_primary_survives() {
        let mut low_r1 = r1("q1", 0, 100, "100M", true);
        low_r1.mapq = 10;
        let mut low_r2 = r2("q1", 0, 250, "100M", false);
        low_r2.mapq = 4;
        let t = Template::from_records("q1".to_string(), vec![low_r1, low_r2]);
        assert!(t.filter(30, 18).is_none());
    }

    #[test]
    fn test_filter_applies_supplementary_threshold() {
        let mut weak_supp = r1_supp("q1", 1, 800, "50S50M", true);
        weak_supp.mapq = 10;
        let records = vec![
            r1("q1", 0, 100, "100M", true),
            weak_supp,
            r1_supp("q1", 2, 900, "60S40M", true),
        ];
        let t = Template::from_records("q1".to_string(), records);
        let view = t.filter(30, 18).unwrap();
        assert_eq!(view.r1, Some(0));
        assert_eq!(view.r1_supplementals, vec![2]);
    }

    #[test]
    fn test_unmapped_template() {
        let mut unmapped = rec("q1", -1, 1, "", true, Flags::UNMAPPED, 0);
        unmapped.pos = -1;
        unmapped.cigar.clear();
        let t = Template::from_records("q1".to_string(), vec![unmapped]);
        assert!(t.is_unmapped());
        assert!(t.filter(30, 18).is_none());
    }
}

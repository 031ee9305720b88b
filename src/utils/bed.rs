//! BED target regions and a by-contig overlap index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Result, bail};

/// One BED interval. `start`/`end` keep BED's 0-based half-open convention;
/// the index methods below take 1-based inclusive queries.
#[derive(Debug, Clone)]
pub struct BedRegion {
    pub contig: String,
    pub start: usize,
    pub end: usize,
    pub name: String,
}

impl BedRegion {
    /// True when the region intersects a 1-based inclusive interval.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start <= self.end
    }
}

pub fn read_bed(bed_path: &str) -> Result<Vec<BedRegion>> {
    let file = match File::open(bed_path) {
        Ok(f) => f,
        Err(e) => bail!("Error opening BED file {}: {}", bed_path, e),
    };
    read_bed_from_reader(BufReader::new(file))
}

pub fn read_bed_from_reader<R: BufRead>(reader: R) -> Result<Vec<BedRegion>> {
    let mut targets: Vec<BedRegion> = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            bail!(
                "Malformed BED line {} (expected at least 3 columns, got {}): {}",
                i + 1,
                parts.len(),
                line
            );
        }

        let contig = parts[0].to_string();
        let start: usize = parts[1]
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid start at line {}: {}", i + 1, e))?;
        let end: usize = parts[2]
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid end at line {}: {}", i + 1, e))?;
        let name = if parts.len() > 3 {
            parts[3].to_string()
        } else {
            format!("{}:{}-{}", contig, start, end)
        };

        targets.push(BedRegion { contig, start, end, name });
    }
    Ok(targets)
}

/// Target regions grouped by contig for overlap lookups.
#[derive(Debug, Clone, Default)]
pub struct TargetIndex {
    by_contig: HashMap<String, Vec<BedRegion>>,
}

impl TargetIndex {
    pub fn new(regions: Vec<BedRegion>) -> Self {
        let mut by_contig: HashMap<String, Vec<BedRegion>> = HashMap::new();
        for region in regions {
            by_contig.entry(region.contig.clone()).or_default().push(region);
        }
        for regions in by_contig.values_mut() {
            regions.sort_by_key(|r| (r.start, r.end));
        }
        TargetIndex { by_contig }
    }

    pub fn contigs(&self) -> impl Iterator<Item = &str> {
        self.by_contig.keys().map(String::as_str)
    }

    /// Regions overlapping a 1-based inclusive interval.
    pub fn overlapping(&self, contig: &str, start: usize, end: usize) -> Vec<&BedRegion> {
        self.by_contig
            .get(contig)
            .map(|regions| regions.iter().filter(|r| r.overlaps(start, end)).collect())
            .unwrap_or_default()
    }

    pub fn overlaps_any(&self, contig: &str, start: usize, end: usize) -> bool {
        !self.overlapping(contig, start, end).is_empty()
    }

    /// Sorted, deduplicated names of regions overlapping the interval, or
    /// None when nothing overlaps.
    pub fn names_overlapping(&self, contig: &str, start: usize, end: usize) -> Option<String> {
        let mut names: Vec<&str> =
            self.overlapping(contig, start, end).into_iter().map(|r| r.name.as_str()).collect();
        if names.is_empty() {
            return None;
        }
        names.sort_unstable();
        names.dedup();
        Some(names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_bed_parsing() {
        let data = "chr1\t100\t200\tgene1\nchr2\t500\t600\n#Comment\n";
        let cursor = Cursor::new(data);
        let regions = read_bed_from_reader(cursor).unwrap();

        assert_eq!(regions.len(), 2);

        // 4 column line
        assert_eq!(regions[0].contig, "chr1");
        assert_eq!(regions[0].start, 100);
        assert_eq!(regions[0].end, 200);
        assert_eq!(regions[0].name, "gene1");

        // 3 column line (name auto-generated)
        assert_eq!(regions[1].contig, "chr2");
        assert_eq!(regions[1].name, "chr2:500-600");
    }

    #[test]
    fn test_bed_malformed() {
        // Line 2 is malformed (only 2 cols) — should be a fatal error
        let data = "chr1\t100\t200\nchr2\t500\nchr3\t1000\t2000";
        let cursor = Cursor::new(data);
        let result = read_bed_from_reader(cursor);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Malformed BED line 2"));
    }

    #[test]
    fn test_target_index_overlap_is_one_based() {
        // BED chr1:100-200 covers 1-based positions 101..=200.
        let regions = read_bed_from_reader(Cursor::new("chr1\t100\t200\tgene1\n")).unwrap();
        let index = TargetIndex::new(regions);
        assert!(!index.overlaps_any("chr1", 100, 100));
        assert!(index.overlaps_any("chr1", 101, 101));
        assert!(index.overlaps_any("chr1", 200, 200));
        assert!(!index.overlaps_any("chr1", 201, 201));
        assert!(!index.overlaps_any("chr2", 150, 150));
    }

    #[test]
    fn test_target_index_names_sorted_and_deduped() {
        let data = "chr1\t100\t200\tb\nchr1\t150\t300\ta\nchr1\t180\t220\ta\n";
        let index = TargetIndex::new(read_bed_from_reader(Cursor::new(data)).unwrap());
        assert_eq!(index.names_overlapping("chr1", 190, 195), Some("a,b".to_string()));
        assert_eq!(index.names_overlapping("chr1", 290, 295), Some("a".to_string()));
        assert_eq!(index.names_overlapping("chr1", 500, 600), None);
    }
}

//! Unified alignment input that supports both BAM and CRAM files via noodles.
//!
//! Decodes records into a plain [`AlignmentRecord`] so the rest of the crate
//! is independent of the container format. Unlike a minimal decode, the
//! record keeps its tag data and mate fields so an annotated copy of the
//! input can be written back out.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result, anyhow, bail};

use noodles::bam;
use noodles::bgzf;
use noodles::core::{Position, Region};
use noodles::cram;
use noodles::fasta;
use noodles::sam;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::cigar::op::Op;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{Cigar, Data, QualityScores, RecordBuf, Sequence};

pub use noodles::sam::alignment::record::cigar::op::Kind as CigarKind;

/// One `@SQ` entry from the input header.
#[derive(Debug, Clone)]
pub struct SequenceEntry {
    pub name: String,
    pub length: usize,
    /// True when the header marks the contig circular (`TP:circular`),
    /// e.g. the mitochondrial genome.
    pub circular: bool,
}

/// Contig names, lengths and topology extracted from the SAM header.
#[derive(Debug, Clone, Default)]
pub struct SequenceDictionary {
    entries: Vec<SequenceEntry>,
    by_name: HashMap<String, usize>,
}

impl SequenceDictionary {
    pub fn from_sam_header(header: &sam::Header) -> Self {
        let mut entries = Vec::new();
        let mut by_name = HashMap::new();
        for (name, map) in header.reference_sequences().iter() {
            let name = String::from_utf8_lossy(name).into_owned();
            let circular = map
                .other_fields()
                .iter()
                .any(|(tag, value)| tag.as_ref() == b"TP" && value.to_string() == "circular");
            by_name.insert(name.clone(), entries.len());
            entries.push(SequenceEntry { name, length: map.length().get(), circular });
        }
        SequenceDictionary { entries, by_name }
    }

    /// Returns the contig name for a reference index.
    pub fn name(&self, ref_index: usize) -> Option<&str> {
        self.entries.get(ref_index).map(|e| e.name.as_str())
    }

    /// Returns the reference index for a contig name.
    pub fn ref_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn is_circular(&self, ref_index: usize) -> bool {
        self.entries.get(ref_index).is_some_and(|e| e.circular)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SequenceEntry] {
        &self.entries
    }
}

/// A record wrapper that provides a uniform interface over noodles BAM/CRAM
/// records. Positions are stored 0-based internally, mirroring BAM; the
/// accessors below convert to 1-based inclusive coordinates.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    pub name: Option<String>,
    pub ref_id: i32,
    pub pos: i32, // 0-based, -1 if unmapped
    pub flag: u16,
    pub mapq: u8,
    pub cigar: Vec<(CigarKind, usize)>, // decoded cigar ops
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
    pub next_ref_id: i32,
    pub next_pos: i32,
    pub tlen: i32,
    /// Optional tags, kept so annotated records can be re-emitted.
    pub data: Data,
}

impl Default for AlignmentRecord {
    fn default() -> Self {
        AlignmentRecord {
            name: None,
            ref_id: -1,
            pos: -1,
            flag: 0,
            mapq: 255,
            cigar: Vec::new(),
            seq: Vec::new(),
            qual: Vec::new(),
            next_ref_id: -1,
            next_pos: -1,
            tlen: 0,
            data: Data::default(),
        }
    }
}

impl AlignmentRecord {
    /// Returns the read name, if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flag)
    }

    pub fn is_mapped(&self) -> bool {
        self.ref_id >= 0 && self.pos >= 0 && !self.flags().is_unmapped()
    }

    pub fn is_paired(&self) -> bool {
        self.flags().is_segmented()
    }

    /// True for the first read of a pair, and for unpaired reads.
    pub fn is_first_of_pair(&self) -> bool {
        !self.is_paired() || self.flags().is_first_segment()
    }

    pub fn is_secondary(&self) -> bool {
        self.flags().is_secondary()
    }

    pub fn is_supplementary(&self) -> bool {
        self.flags().is_supplementary()
    }

    pub fn is_positive_strand(&self) -> bool {
        !self.flags().is_reverse_complemented()
    }

    pub fn is_mate_mapped(&self) -> bool {
        self.is_paired() && self.next_ref_id >= 0 && !self.flags().is_mate_unmapped()
    }

    pub fn is_mate_positive_strand(&self) -> bool {
        !self.flags().is_mate_reverse_complemented()
    }

    /// Returns the 1-based alignment start position, or None if unmapped.
    pub fn alignment_start(&self) -> Option<usize> {
        if self.pos >= 0 { Some(self.pos as usize + 1) } else { None }
    }

    /// Returns the alignment span on the reference (sum of M/D/N/=/X ops).
    pub fn alignment_span(&self) -> usize {
        cigar_reference_length(&self.cigar)
    }

    /// Returns the 1-based inclusive alignment end position.
    pub fn alignment_end(&self) -> Option<usize> {
        let start = self.alignment_start()?;
        let span = self.alignment_span();
        if span == 0 { None } else { Some(start + span - 1) }
    }

    /// Returns the mate's 1-based alignment start position.
    pub fn mate_alignment_start(&self) -> Option<usize> {
        if self.next_pos >= 0 { Some(self.next_pos as usize + 1) } else { None }
    }

    /// Returns the mate's 1-based inclusive alignment end, derived from the
    /// mate-CIGAR (`MC`) tag. Falls back to the mate start when the tag is
    /// absent or unparseable.
    pub fn mate_alignment_end(&self) -> Option<usize> {
        let start = self.mate_alignment_start()?;
        if let Some(Value::String(s)) = self.data.get(&Tag::MATE_CIGAR)
            && let Ok(ops) = parse_cigar(&String::from_utf8_lossy(s.as_ref()))
        {
            let span = cigar_reference_length(&ops);
            if span > 0 {
                return Some(start + span - 1);
            }
        }
        Some(start)
    }

    /// Iterates over CIGAR operations as (Kind, length) pairs.
    pub fn cigar_ops(&self) -> &[(CigarKind, usize)] {
        &self.cigar
    }

    /// Sets a string tag on the record, replacing any existing value.
    pub fn set_tag(&mut self, tag: [u8; 2], value: &str) {
        self.data.insert(Tag::from(tag), Value::String(value.into()));
    }

    fn from_buf(buf: RecordBuf) -> Self {
        let name = buf.name().map(|n| String::from_utf8_lossy(n.as_ref()).into_owned());
        let ref_id = buf.reference_sequence_id().map_or(-1, |id| id as i32);
        let pos = buf.alignment_start().map_or(-1, |p| p.get() as i32 - 1);
        let flag = buf.flags().bits();
        let mapq = buf.mapping_quality().map_or(255, |q| q.get());
        let cigar = buf.cigar().as_ref().iter().map(|op| (op.kind(), op.len())).collect();
        let seq = buf.sequence().as_ref().to_vec();
        let qual = buf.quality_scores().as_ref().to_vec();
        let next_ref_id = buf.mate_reference_sequence_id().map_or(-1, |id| id as i32);
        let next_pos = buf.mate_alignment_start().map_or(-1, |p| p.get() as i32 - 1);
        let tlen = buf.template_length();
        let data = buf.data().clone();
        AlignmentRecord {
            name,
            ref_id,
            pos,
            flag,
            mapq,
            cigar,
            seq,
            qual,
            next_ref_id,
            next_pos,
            tlen,
            data,
        }
    }

    /// Rebuilds a noodles record buffer for writing.
    pub fn to_record_buf(&self) -> Result<RecordBuf> {
        let mut builder = RecordBuf::builder().set_flags(Flags::from_bits_truncate(self.flag));
        if let Some(name) = &self.name {
            builder = builder.set_name(name.as_str());
        }
        if self.ref_id >= 0 {
            builder = builder.set_reference_sequence_id(self.ref_id as usize);
        }
        if self.pos >= 0 {
            builder = builder.set_alignment_start(Position::try_from(self.pos as usize + 1)?);
        }
        if let Some(mapq) = sam::alignment::record::MappingQuality::new(self.mapq) {
            builder = builder.set_mapping_quality(mapq);
        }
        if !self.cigar.is_empty() {
            let ops: Vec<Op> =
                self.cigar.iter().map(|&(kind, len)| Op::new(kind, len)).collect();
            builder = builder.set_cigar(Cigar::from(ops));
        }
        if !self.seq.is_empty() {
            builder = builder.set_sequence(Sequence::from(self.seq.clone()));
        }
        if !self.qual.is_empty() {
            builder = builder.set_quality_scores(QualityScores::from(self.qual.clone()));
        }
        if self.next_ref_id >= 0 {
            builder = builder.set_mate_reference_sequence_id(self.next_ref_id as usize);
        }
        if self.next_pos >= 0 {
            builder =
                builder.set_mate_alignment_start(Position::try_from(self.next_pos as usize + 1)?);
        }
        builder = builder.set_template_length(self.tlen).set_data(self.data.clone());
        Ok(builder.build())
    }
}

/// Parses a CIGAR string (e.g. `"50M50S"`) into operator/length pairs.
pub fn parse_cigar(text: &str) -> Result<Vec<(CigarKind, usize)>> {
    let mut ops = Vec::new();
    let mut len: usize = 0;
    let mut saw_digit = false;
    for c in text.chars() {
        if let Some(d) = c.to_digit(10) {
            len = len * 10 + d as usize;
            saw_digit = true;
            continue;
        }
        if !saw_digit {
            bail!("Invalid CIGAR '{}': operator '{}' without a length", text, c);
        }
        let kind = match c {
            'M' => CigarKind::Match,
            'I' => CigarKind::Insertion,
            'D' => CigarKind::Deletion,
            'N' => CigarKind::Skip,
            'S' => CigarKind::SoftClip,
            'H' => CigarKind::HardClip,
            'P' => CigarKind::Pad,
            '=' => CigarKind::SequenceMatch,
            'X' => CigarKind::SequenceMismatch,
            _ => bail!("Invalid CIGAR '{}': unknown operator '{}'", text, c),
        };
        ops.push((kind, len));
        len = 0;
        saw_digit = false;
    }
    if saw_digit {
        bail!("Invalid CIGAR '{}': trailing length without an operator", text);
    }
    Ok(ops)
}

/// Sum of the reference-consuming operator lengths (M/D/N/=/X).
pub fn cigar_reference_length(ops: &[(CigarKind, usize)]) -> usize {
    ops.iter()
        .filter(|(kind, _)| {
            matches!(
                kind,
                CigarKind::Match
                    | CigarKind::Deletion
                    | CigarKind::Skip
                    | CigarKind::SequenceMatch
                    | CigarKind::SequenceMismatch
            )
        })
        .map(|&(_, len)| len)
        .sum()
}

/// Inner reader enum
enum Inner {
    Bam(bam::io::IndexedReader<bgzf::Reader<File>>),
    BamNoIndex(bam::io::Reader<bgzf::Reader<BufReader<File>>>),
    Cram(cram::io::IndexedReader<File>),
    CramNoIndex(cram::io::Reader<BufReader<File>>),
}

/// Unified alignment input wrapping either BAM or CRAM via noodles.
pub struct AlignmentInput {
    inner: Inner,
    sam_header: sam::Header,
    pub dict: SequenceDictionary,
    /// Buffer for CRAM records (one container's worth at a time)
    cram_record_buf: VecDeque<AlignmentRecord>,
    /// FASTA reference repository for CRAM decoding
    fasta_repo: fasta::Repository,
}

impl AlignmentInput {
    /// Open an alignment file (BAM or CRAM), auto-detected by magic bytes
    /// (falling back to file extension).
    pub fn open(path: &str, ref_path: Option<&str>) -> Result<Self> {
        let fasta_repo = if let Some(rp) = ref_path {
            let indexed_reader = fasta::io::indexed_reader::Builder::default()
                .build_from_path(rp)
                .with_context(|| format!("Failed to open FASTA reference {}", rp))?;
            let adapter = fasta::repository::adapters::IndexedReader::new(indexed_reader);
            Some(fasta::Repository::new(adapter))
        } else {
            None
        };

        if Self::is_cram_file(path) {
            Self::open_cram(path, fasta_repo)
        } else {
            Self::open_bam(path)
        }
    }

    /// Detect whether a file is CRAM by reading the first 4 magic bytes
    /// ("CRAM"), falling back to file extension if the file can't be read.
    fn is_cram_file(path: &str) -> bool {
        if let Ok(mut f) = File::open(path) {
            let mut magic = [0u8; 4];
            if std::io::Read::read_exact(&mut f, &mut magic).is_ok() {
                return &magic == b"CRAM";
            }
        }
        path.ends_with(".cram")
    }

    fn open_bam(path: &str) -> Result<Self> {
        let index_path = format!("{}.bai", path);
        let has_index = std::path::Path::new(&index_path).exists();

        if has_index {
            let mut reader = bam::io::indexed_reader::Builder::default()
                .build_from_path(path)
                .with_context(|| format!("Failed to open BAM {}", path))?;
            let sam_header = reader.read_header()?;
            let dict = SequenceDictionary::from_sam_header(&sam_header);
            Ok(AlignmentInput {
                inner: Inner::Bam(reader),
                sam_header,
                dict,
                cram_record_buf: VecDeque::new(),
                fasta_repo: fasta::Repository::default(),
            })
        } else {
            let file = File::open(path).with_context(|| format!("Failed to open BAM {}", path))?;
            let mut reader = bam::io::Reader::new(BufReader::new(file));
            let sam_header = reader.read_header()?;
            let dict = SequenceDictionary::from_sam_header(&sam_header);
            Ok(AlignmentInput {
                inner: Inner::BamNoIndex(reader),
                sam_header,
                dict,
                cram_record_buf: VecDeque::new(),
                fasta_repo: fasta::Repository::default(),
            })
        }
    }

    fn open_cram(path: &str, fasta_repo: Option<fasta::Repository>) -> Result<Self> {
        let repo = fasta_repo.unwrap_or_default();
        let index_path = format!("{}.crai", path);
        let has_index = std::path::Path::new(&index_path).exists();

        if has_index {
            let mut reader = cram::io::indexed_reader::Builder::default()
                .set_reference_sequence_repository(repo.clone())
                .build_from_path(path)
                .with_context(|| format!("Failed to open CRAM {}", path))?;
            let sam_header = reader.read_header()?;
            let dict = SequenceDictionary::from_sam_header(&sam_header);
            Ok(AlignmentInput {
                inner: Inner::Cram(reader),
                sam_header,
                dict,
                cram_record_buf: VecDeque::new(),
                fasta_repo: repo,
            })
        } else {
            let file = File::open(path).with_context(|| format!("Failed to open CRAM {}", path))?;
            let mut reader = cram::io::reader::Builder::default()
                .set_reference_sequence_repository(repo.clone())
                .build_from_reader(BufReader::new(file));
            let sam_header = reader.read_header()?;
            let dict = SequenceDictionary::from_sam_header(&sam_header);
            Ok(AlignmentInput {
                inner: Inner::CramNoIndex(reader),
                sam_header,
                dict,
                cram_record_buf: VecDeque::new(),
                fasta_repo: repo,
            })
        }
    }

    /// Fill the CRAM record buffer by reading and decoding the next container.
    fn fill_cram_buffer(&mut self) -> Result<()> {
        let mut container = cram::io::reader::Container::default();

        let bytes_read = match &mut self.inner {
            Inner::Cram(r) => r.read_container(&mut container)?,
            Inner::CramNoIndex(r) => r.read_container(&mut container)?,
            _ => unreachable!(),
        };

        if bytes_read == 0 {
            return Ok(()); // EOF
        }

        let compression_header = container.compression_header()?;

        for slice_result in container.slices() {
            let slice = slice_result?;
            let (core_data_src, external_data_srcs) = slice.decode_blocks()?;
            let cram_records = slice.records(
                self.fasta_repo.clone(),
                &self.sam_header,
                &compression_header,
                &core_data_src,
                &external_data_srcs,
            )?;
            for cram_rec in &cram_records {
                let buf = RecordBuf::try_from_alignment_record(&self.sam_header, cram_rec)?;
                self.cram_record_buf.push_back(AlignmentRecord::from_buf(buf));
            }
        }

        Ok(())
    }

    /// Read the next alignment record.
    pub fn read_record(&mut self) -> Result<Option<AlignmentRecord>> {
        // For CRAM, use the record buffer (filled on first call)
        if matches!(self.inner, Inner::Cram(_) | Inner::CramNoIndex(_)) {
            if self.cram_record_buf.is_empty() {
                self.fill_cram_buffer()?;
                if self.cram_record_buf.is_empty() {
                    return Ok(None); // EOF
                }
            }
            return Ok(self.cram_record_buf.pop_front());
        }

        let mut buf = bam::Record::default();
        let bytes_read = match &mut self.inner {
            Inner::Bam(r) => r.read_record(&mut buf)?,
            Inner::BamNoIndex(r) => r.read_record(&mut buf)?,
            _ => unreachable!(),
        };
        if bytes_read == 0 {
            return Ok(None);
        }
        let decoded = RecordBuf::try_from_alignment_record(&self.sam_header, &buf)?;
        Ok(Some(AlignmentRecord::from_buf(decoded)))
    }

    /// Collect all records overlapping a 1-based inclusive interval.
    /// Requires an indexed input.
    pub fn query(&mut self, contig: &str, start: usize, end: usize) -> Result<Vec<AlignmentRecord>> {
        let start = start.max(1);
        let end = end.max(start);
        let region =
            Region::new(contig, Position::try_from(start)?..=Position::try_from(end)?);

        match &mut self.inner {
            Inner::Bam(r) => {
                let header = &self.sam_header;
                r.query(header, &region)?
                    .map(|result| {
                        let rec = result?;
                        let buf = RecordBuf::try_from_alignment_record(header, &rec)?;
                        Ok(AlignmentRecord::from_buf(buf))
                    })
                    .collect()
            }
            Inner::Cram(r) => {
                let header = &self.sam_header;
                r.query(header, &region)?
                    .map(|result| {
                        let rec = result?;
                        let buf = RecordBuf::try_from_alignment_record(header, &rec)?;
                        Ok(AlignmentRecord::from_buf(buf))
                    })
                    .collect()
            }
            _ => Err(anyhow!("Region queries require an indexed BAM/CRAM file")),
        }
    }

    /// Returns the noodles sam::Header.
    pub fn sam_header(&self) -> &sam::Header {
        &self.sam_header
    }

    /// Returns true if this is a CRAM input.
    pub fn is_cram(&self) -> bool {
        matches!(self.inner, Inner::Cram(_) | Inner::CramNoIndex(_))
    }

    /// Returns true if an index file was found for this reader.
    pub fn has_index(&self) -> bool {
        matches!(self.inner, Inner::Bam(_) | Inner::Cram(_))
    }

    /// Check that an index exists, returning a clear error if not.
    pub fn require_index(&self, path: &str) -> Result<()> {
        if !self.has_index() {
            let expected = if self.is_cram() {
                format!("{}.crai", path)
            } else {
                format!("{}.bai", path)
            };
            bail!(
                "Index file not found for '{}'. Expected '{}'. \
                 Create one with 'samtools index'.",
                path,
                expected
            );
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use noodles::sam::alignment::record::data::field::Tag;

    #[test]
    fn test_parse_cigar() {
        let ops = parse_cigar("50M50S").unwrap();
        assert_eq!(ops, vec![(CigarKind::Match, 50), (CigarKind::SoftClip, 50)]);

        let ops = parse_cigar("30S40M30H").unwrap();
        assert_eq!(
            ops,
            vec![(CigarKind::SoftClip, 30), (CigarKind::Match, 40), (CigarKind::HardClip, 30)]
        );

        assert!(parse_cigar("M").is_err());
        assert!(parse_cigar("10M5").is_err());
        assert!(parse_cigar("10Q").is_err());
    }

    #[test]
    fn test_cigar_reference_length() {
        let ops = parse_cigar("10S30M5D20M10S").unwrap();
        assert_eq!(cigar_reference_length(&ops), 55);
        let ops = parse_cigar("50S50I").unwrap();
        assert_eq!(cigar_reference_length(&ops), 0);
    }

    #[test]
    fn test_alignment_end() {
        let rec = testutil::r1("q1", 0, 100, "50M50S", true);
        assert_eq!(rec.alignment_start(), Some(100));
        assert_eq!(rec.alignment_end(), Some(149));
    }

    #[test]
    fn test_mate_alignment_end_uses_mate_cigar() {
        let mut rec = testutil::r1("q1", 0, 100, "100M", true);
        rec.next_ref_id = 0;
        rec.next_pos = 249; // 1-based 250
        assert_eq!(rec.mate_alignment_end(), Some(250));
        rec.set_tag(*b"MC", "100M");
        assert_eq!(rec.mate_alignment_end(), Some(349));
    }

    #[test]
    fn test_record_round_trips_through_record_buf() {
        let mut rec = testutil::r1("q1", 1, 100, "10M", true);
        rec.seq = b"ACGTACGTAC".to_vec();
        rec.qual = vec![30; 10];
        rec.set_tag(*b"be", "0;left;from;split_read");
        let buf = rec.to_record_buf().unwrap();
        let back = AlignmentRecord::from_buf(buf);
        assert_eq!(back.name.as_deref(), Some("q1"));
        assert_eq!(back.ref_id, 1);
        assert_eq!(back.alignment_start(), Some(100));
        assert_eq!(back.cigar, rec.cigar);
        assert_eq!(back.seq, rec.seq);
        assert!(back.data.get(&Tag::from(*b"be")).is_some());
    }
}

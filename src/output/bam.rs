//! BAM sink for the annotated copy of the input alignments.

use std::fs::File;

use anyhow::{Context, Result};
use noodles::bam;
use noodles::bgzf;
use noodles::sam;
use noodles::sam::alignment::io::Write as _;

use crate::input::AlignmentRecord;

/// Writes records back out in input order, preserving queryname grouping.
pub struct AlignmentSink {
    writer: bam::io::Writer<bgzf::Writer<File>>,
    header: sam::Header,
}

impl AlignmentSink {
    pub fn create(path: &str, header: sam::Header) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create BAM {}", path))?;
        let mut writer = bam::io::Writer::new(file);
        writer.write_header(&header)?;
        Ok(AlignmentSink { writer, header })
    }

    pub fn write(&mut self, record: &AlignmentRecord) -> Result<()> {
        let buf = record.to_record_buf()?;
        self.writer.write_alignment_record(&self.header, &buf)?;
        Ok(())
    }

    /// Flushes the BGZF stream and writes the EOF block.
    pub fn finish(mut self) -> Result<()> {
        self.writer.try_finish()?;
        Ok(())
    }
}

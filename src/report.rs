//! Block group report
//!
//! One row per block group of a scanned trace, for logs and CSV export.

use crate::constants::block_address;
use crate::reference::ReferenceTrace;
use crate::{PlayerError, Result};
use serde::Serialize;
use std::io::Write;

/// Summary of one block group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockGroupReport {
    /// Trace time the group's bytes were last written before its first use
    pub written_at: u32,
    /// First DPCM block
    pub block: u16,
    /// CPU address of the first block
    pub address: String,
    /// Trace time of the first use
    pub first_use: Option<u32>,
    /// Number of uses
    pub references: usize,
    /// Bank slots needed
    pub blocks: u16,
    /// Bytes to transfer
    pub bytes: usize,
}

/// Build the report rows in group creation order
pub fn block_group_report(trace: &ReferenceTrace) -> Vec<BlockGroupReport> {
    trace
        .groups()
        .map(|(id, group)| {
            let key = group.key();
            BlockGroupReport {
                written_at: key.written_at,
                block: key.block,
                address: format!("${:04X}", block_address(key.block)),
                first_use: trace
                    .references()
                    .iter()
                    .find(|reference| reference.group == id)
                    .map(|reference| reference.time),
                references: group.reference_count(),
                blocks: group.block_size(),
                bytes: group.byte_len(),
            }
        })
        .collect()
}

/// Bank slots needed to hold every group at once
pub fn total_blocks(rows: &[BlockGroupReport]) -> u32 {
    rows.iter().map(|row| u32::from(row.blocks)).sum()
}

/// Write the rows as CSV with a header line
pub fn write_csv<W: Write>(rows: &[BlockGroupReport], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)
            .map_err(|e| PlayerError::Other(format!("CSV write failed: {}", e)))?;
    }
    csv.flush()?;
    Ok(())
}

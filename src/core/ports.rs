use crate::core::job::PortBlock;
use std::collections::BTreeSet;

pub const MAX_PORT: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no free block of {block_size} contiguous ports at or above {base_port}")]
pub struct PortExhaustionError {
    pub block_size: u32,
    pub base_port: u16,
}

/// Find the lowest block of `block_size` contiguous ports starting at or
/// above `base_port` that shares no port with `reserved`.
///
/// Candidate blocks slide up one port at a time, so a freed gap below a live
/// reservation is reused before anything above it. The search stops at the
/// top of the port range.
pub fn allocate(
    block_size: u32,
    base_port: u16,
    reserved: &BTreeSet<u16>,
) -> Result<PortBlock, PortExhaustionError> {
    let exhausted = PortExhaustionError {
        block_size,
        base_port,
    };
    if block_size == 0 {
        return Ok(PortBlock::new());
    }

    let base = u32::from(base_port);
    let last_start = u32::from(MAX_PORT)
        .checked_sub(block_size - 1)
        .filter(|&last| last >= base)
        .ok_or_else(|| exhausted.clone())?;

    let mut start = base;
    while start <= last_start {
        let end = start + block_size - 1;
        // Ports are u16, so both bounds fit once `end <= MAX_PORT`.
        match reserved.range(start as u16..=end as u16).next_back() {
            // Skip past the highest clash instead of stepping one at a time;
            // every start in between would overlap it too.
            Some(&clash) => start = u32::from(clash) + 1,
            None => return Ok((start..=end).map(|p| p as u16).collect()),
        }
    }

    Err(exhausted)
}

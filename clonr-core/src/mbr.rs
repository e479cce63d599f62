//! Legacy (MBR) partition table parsing, used to decide how much of a device
//! a create operation images.

/// Byte offset of the first primary partition entry in sector 0.
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 16;
const PRIMARY_ENTRIES: usize = 4;

/// One primary partition entry, as far as extent computation cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub start_sector: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    /// The first sector past the partition.
    pub fn end_sector(&self) -> u64 {
        self.start_sector as u64 + self.sector_count as u64
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parses the four primary entries of a partition table sector. Returns
/// fewer entries if `sector` is too short to hold them all.
pub fn primary_entries(sector: &[u8]) -> Vec<PartitionEntry> {
    (0..PRIMARY_ENTRIES)
        .map(|i| PARTITION_TABLE_OFFSET + i * ENTRY_SIZE)
        .take_while(|offset| offset + ENTRY_SIZE <= sector.len())
        .map(|offset| PartitionEntry {
            start_sector: le_u32(&sector[offset + 8..]),
            sector_count: le_u32(&sector[offset + 12..]),
        })
        .collect()
}

/// The number of sectors to image: the furthest end of any primary
/// partition, and never less than the partition table sector itself.
pub fn imaged_extent(sector: &[u8]) -> u64 {
    primary_entries(sector)
        .iter()
        .map(PartitionEntry::end_sector)
        .fold(1, u64::max)
}

//! Just enough of the MBR/FAT on-disk layout to count free clusters and to
//! lay down a fresh volume.
//!
//! File access itself goes through `embedded-sdmmc`, which neither reports
//! free space nor formats.

use core::slice;

use embedded_sdmmc::{Block, BlockDevice, BlockIdx};
use log::{debug, error, info};

use super::{FormatError, QueryError, SpaceInfo};

pub(crate) const BLOCK_LEN: u32 = 512;

const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

const PARTITION1_OFFSET: usize = 446;

/// Below this many clusters a volume is FAT12, at or above the next one FAT32.
const MIN_FAT16_CLUSTERS: u32 = 4085;
const MIN_FAT32_CLUSTERS: u32 = 65525;
const MAX_FAT32_CLUSTERS: u32 = 0x0FFF_FFF5;

/// Cluster numbering starts at 2.
const FIRST_CLUSTER: u32 = 2;

const PARTITION_START: u32 = 1;
const NUM_FATS: u32 = 2;
const FAT16_ROOT_ENTRIES: u32 = 512;
const MEDIA_FIXED: u8 = 0xF8;
const FAT32_INFO_BLOCK: u32 = 1;
const FAT32_BACKUP_BOOT_BLOCK: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    const fn entry_len(self) -> u32 {
        match self {
            Self::Fat16 => 2,
            Self::Fat32 => 4,
        }
    }
}

fn le16(bytes: &[u8], offset: usize) -> u32 {
    u32::from(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
}

fn le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn put16(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
}

fn put32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Geometry of the allocation table of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FatLayout {
    fat_type: FatType,
    /// Absolute block index of the first FAT.
    fat_start: u32,
    blocks_per_cluster: u32,
    cluster_count: u32,
}

impl FatLayout {
    /// Parse the BIOS parameter block of a volume starting at `lba_start`.
    fn from_boot_sector(bpb: &[u8], lba_start: u32) -> Option<Self> {
        if bpb[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != SIGNATURE || le16(bpb, 11) != BLOCK_LEN {
            return None;
        }

        let blocks_per_cluster = u32::from(bpb[13]);
        let reserved = le16(bpb, 14);
        let root_blocks = (le16(bpb, 17) * 32).div_ceil(BLOCK_LEN);
        let total_blocks = match le16(bpb, 19) {
            0 => le32(bpb, 32),
            n => n,
        };
        let fat_size = match le16(bpb, 22) {
            0 => le32(bpb, 36),
            n => n,
        };

        let non_data = reserved + u32::from(bpb[16]) * fat_size + root_blocks;
        let cluster_count = total_blocks.checked_sub(non_data)?.checked_div(blocks_per_cluster)?;

        let fat_type = match cluster_count {
            n if n < MIN_FAT16_CLUSTERS => return None,
            n if n < MIN_FAT32_CLUSTERS => FatType::Fat16,
            _ => FatType::Fat32,
        };

        Some(Self {
            fat_type,
            fat_start: lba_start + reserved,
            blocks_per_cluster,
            cluster_count,
        })
    }

    fn cluster_bytes(&self) -> u64 {
        u64::from(self.blocks_per_cluster) * u64::from(BLOCK_LEN)
    }

    /// Count unallocated clusters by scanning the first FAT.
    fn count_free_clusters<D: BlockDevice>(&self, card: &D) -> Result<u32, D::Error> {
        let entry_len = self.fat_type.entry_len();
        let entries_per_block = BLOCK_LEN / entry_len;
        let mut blocks = [Block::new()];
        let mut loaded = None;
        let mut free = 0;

        for cluster in FIRST_CLUSTER..FIRST_CLUSTER + self.cluster_count {
            let block_idx = self.fat_start + cluster / entries_per_block;
            if loaded != Some(block_idx) {
                card.read(&mut blocks, BlockIdx(block_idx))?;
                loaded = Some(block_idx);
            }

            let offset = ((cluster % entries_per_block) * entry_len) as usize;
            let entry = match self.fat_type {
                FatType::Fat16 => le16(&blocks[0].contents, offset),
                FatType::Fat32 => le32(&blocks[0].contents, offset) & 0x0FFF_FFFF,
            };
            if entry == 0 {
                free += 1;
            }
        }

        Ok(free)
    }
}

/// Locate the first partition and report its data-area capacity and free space.
pub(crate) fn space_info<D: BlockDevice>(card: &D) -> Result<SpaceInfo, QueryError> {
    let mut blocks = [Block::new()];

    let device_error = |e: D::Error| {
        error!("SD: reading volume layout failed: {:?}", e);
        QueryError::Device
    };

    card.read(&mut blocks, BlockIdx(0)).map_err(device_error)?;
    let mbr = &blocks[0].contents;
    if mbr[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != SIGNATURE {
        return Err(QueryError::Unsupported);
    }
    let lba_start = le32(mbr, PARTITION1_OFFSET + 8);

    card.read(&mut blocks, BlockIdx(lba_start)).map_err(device_error)?;
    let layout = FatLayout::from_boot_sector(&blocks[0].contents, lba_start)
        .ok_or(QueryError::Unsupported)?;
    debug!("SD: volume layout {:?}", layout);

    let free_clusters = layout.count_free_clusters(card).map_err(device_error)?;

    Ok(SpaceInfo {
        total_bytes: u64::from(layout.cluster_count) * layout.cluster_bytes(),
        free_bytes: u64::from(free_clusters) * layout.cluster_bytes(),
    })
}

/// Sizes of a volume about to be written.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    fat_type: FatType,
    volume_blocks: u32,
    blocks_per_cluster: u32,
    reserved: u32,
    root_blocks: u32,
    fat_size: u32,
    cluster_count: u32,
}

impl Geometry {
    fn new(fat_type: FatType, volume_blocks: u32, blocks_per_cluster: u32) -> Option<Self> {
        let (reserved, root_blocks) = match fat_type {
            FatType::Fat16 => (1, FAT16_ROOT_ENTRIES * 32 / BLOCK_LEN),
            FatType::Fat32 => (32, 0),
        };
        let available = volume_blocks.checked_sub(reserved + root_blocks)?;
        // One entry per cluster plus the two reserved ones
        let fat_bytes =
            (u64::from(available / blocks_per_cluster) + 2) * u64::from(fat_type.entry_len());
        let fat_size = u32::try_from(fat_bytes.div_ceil(u64::from(BLOCK_LEN))).ok()?;
        let cluster_count = available.checked_sub(NUM_FATS * fat_size)? / blocks_per_cluster;

        Some(Self {
            fat_type,
            volume_blocks,
            blocks_per_cluster,
            reserved,
            root_blocks,
            fat_size,
            cluster_count,
        })
    }

    /// FAT16 when the clusters fit, shrinking the cluster size on small
    /// cards; FAT32 otherwise.
    fn choose(volume_blocks: u32, allocation_unit_size: u32) -> Result<Self, FormatError> {
        let requested = (allocation_unit_size / BLOCK_LEN).clamp(1, 128);
        let mut blocks_per_cluster = 1 << (u32::BITS - 1 - requested.leading_zeros());

        loop {
            let fat16 = Self::new(FatType::Fat16, volume_blocks, blocks_per_cluster)
                .ok_or(FormatError::TooSmall)?;

            if fat16.cluster_count >= MIN_FAT32_CLUSTERS {
                return Self::new(FatType::Fat32, volume_blocks, blocks_per_cluster)
                    .filter(|g| {
                        (MIN_FAT32_CLUSTERS..MAX_FAT32_CLUSTERS).contains(&g.cluster_count)
                    })
                    .ok_or(FormatError::TooLarge);
            }
            if fat16.cluster_count >= MIN_FAT16_CLUSTERS {
                return Ok(fat16);
            }
            if blocks_per_cluster == 1 {
                return Err(FormatError::TooSmall);
            }
            blocks_per_cluster /= 2;
        }
    }

    /// Blocks from the partition start to the end of the root directory.
    fn metadata_blocks(&self) -> u32 {
        let root = match self.fat_type {
            FatType::Fat16 => self.root_blocks,
            FatType::Fat32 => self.blocks_per_cluster,
        };
        self.reserved + NUM_FATS * self.fat_size + root
    }

    fn boot_sector(&self) -> Block {
        let mut block = Block::new();
        let bpb = &mut block.contents;
        let fat32 = self.fat_type == FatType::Fat32;

        bpb[0..3].copy_from_slice(&[0xEB, if fat32 { 0x58 } else { 0x3C }, 0x90]);
        bpb[3..11].copy_from_slice(b"IRLOG1.0");
        put16(bpb, 11, BLOCK_LEN);
        bpb[13] = self.blocks_per_cluster as u8;
        put16(bpb, 14, self.reserved);
        bpb[16] = NUM_FATS as u8;
        bpb[21] = MEDIA_FIXED;
        put16(bpb, 24, 63);
        put16(bpb, 26, 255);
        put32(bpb, 28, PARTITION_START);

        if !fat32 && self.volume_blocks <= u32::from(u16::MAX) {
            put16(bpb, 19, self.volume_blocks);
        } else {
            put32(bpb, 32, self.volume_blocks);
        }

        let ext = if fat32 {
            put32(bpb, 36, self.fat_size);
            put32(bpb, 44, FIRST_CLUSTER);
            put16(bpb, 48, FAT32_INFO_BLOCK);
            put16(bpb, 50, FAT32_BACKUP_BOOT_BLOCK);
            64
        } else {
            put16(bpb, 17, FAT16_ROOT_ENTRIES);
            put16(bpb, 22, self.fat_size);
            36
        };
        bpb[ext] = 0x80;
        bpb[ext + 2] = 0x29;
        put32(bpb, ext + 3, 0x1234_5678);
        bpb[ext + 7..ext + 18].copy_from_slice(b"IRLOG      ");
        bpb[ext + 18..ext + 26].copy_from_slice(if fat32 { b"FAT32   " } else { b"FAT16   " });
        bpb[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);

        block
    }
}

/// Write an MBR with one FAT partition covering the whole card.
///
/// Only the partition table, the allocation tables and the root directory
/// are cleared; the data area is left as it was.
pub(crate) fn format<D: BlockDevice>(card: &D, allocation_unit_size: u32) -> Result<(), FormatError> {
    let device_error = |e: D::Error| {
        error!("SD: format failed: {:?}", e);
        FormatError::Device
    };
    let write = |block: &Block, idx: u32| {
        card.write(slice::from_ref(block), BlockIdx(idx))
            .map_err(device_error)
    };

    let num_blocks = card.num_blocks().map_err(device_error)?.0;
    let volume_blocks = num_blocks
        .checked_sub(PARTITION_START)
        .ok_or(FormatError::TooSmall)?;
    let geometry = Geometry::choose(volume_blocks, allocation_unit_size)?;
    let fat32 = geometry.fat_type == FatType::Fat32;

    let zero = Block::new();
    for idx in 0..PARTITION_START + geometry.metadata_blocks() {
        write(&zero, idx)?;
    }

    let mut mbr = Block::new();
    let entry = &mut mbr.contents[PARTITION1_OFFSET..PARTITION1_OFFSET + 16];
    // FAT16 (CHS+LBA) or FAT32 (LBA)
    entry[4] = if fat32 { 0x0C } else { 0x06 };
    put32(entry, 8, PARTITION_START);
    put32(entry, 12, volume_blocks);
    mbr.contents[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);
    write(&mbr, 0)?;

    let boot_sector = geometry.boot_sector();
    write(&boot_sector, PARTITION_START)?;

    let mut first_fat_block = Block::new();
    if fat32 {
        write(&boot_sector, PARTITION_START + FAT32_BACKUP_BOOT_BLOCK)?;

        let mut info = Block::new();
        put32(&mut info.contents, 0, 0x4161_5252);
        put32(&mut info.contents, 484, 0x6141_7272);
        put32(&mut info.contents, 488, geometry.cluster_count - 1);
        put32(&mut info.contents, 492, FIRST_CLUSTER + 1);
        info.contents[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);
        write(&info, PARTITION_START + FAT32_INFO_BLOCK)?;

        // Media entry, reserved entry, root directory end-of-chain
        put32(&mut first_fat_block.contents, 0, 0x0FFF_FF00 | u32::from(MEDIA_FIXED));
        put32(&mut first_fat_block.contents, 4, 0x0FFF_FFFF);
        put32(&mut first_fat_block.contents, 8, 0x0FFF_FFFF);
    } else {
        first_fat_block.contents[0..4].copy_from_slice(&[MEDIA_FIXED, 0xFF, 0xFF, 0xFF]);
    }
    for fat in 0..NUM_FATS {
        write(
            &first_fat_block,
            PARTITION_START + geometry.reserved + fat * geometry.fat_size,
        )?;
    }

    info!(
        "SD: formatted {:?}, {} clusters of {} bytes",
        geometry.fat_type,
        geometry.cluster_count,
        geometry.blocks_per_cluster * BLOCK_LEN
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamCard;

    fn layout(card: &RamCard) -> FatLayout {
        let mut blocks = [Block::new()];
        card.read(&mut blocks, BlockIdx(PARTITION_START)).unwrap();
        FatLayout::from_boot_sector(&blocks[0].contents, PARTITION_START).unwrap()
    }

    #[test]
    fn test_small_card_falls_back_to_single_block_clusters() {
        let card = RamCard::formatted(RamCard::DEFAULT_BLOCKS, 16 * 1024).unwrap();
        let layout = layout(&card);

        assert_eq!(layout.fat_type, FatType::Fat16);
        assert_eq!(layout.blocks_per_cluster, 1);
        // 8191 - (1 + 2 * 32 + 32)
        assert_eq!(layout.cluster_count, 8094);
        assert_eq!(layout.fat_start, 2);
    }

    #[test]
    fn test_allocation_unit_honoured_when_it_fits() {
        let card = RamCard::formatted(20_000, 2048).unwrap();
        assert_eq!(layout(&card).blocks_per_cluster, 4);
    }

    #[test]
    fn test_fresh_fat16_volume_is_empty() {
        let card = RamCard::formatted(RamCard::DEFAULT_BLOCKS, 512).unwrap();
        let info = space_info(&card).unwrap();

        assert_eq!(info.total_bytes, 8094 * 512);
        assert_eq!(info.free_bytes, info.total_bytes);
    }

    #[test]
    fn test_large_card_gets_fat32() {
        let card = RamCard::formatted(70_000, 512).unwrap();
        let layout = layout(&card);
        assert_eq!(layout.fat_type, FatType::Fat32);

        // Only the root directory cluster is taken
        let info = space_info(&card).unwrap();
        assert_eq!(info.free_bytes, info.total_bytes - 512);
    }

    #[test]
    fn test_too_small() {
        assert_eq!(RamCard::formatted(64, 512).err(), Some(FormatError::TooSmall));
        assert_eq!(RamCard::formatted(0, 512).err(), Some(FormatError::TooSmall));
    }

    #[test]
    fn test_unformatted_card_is_unsupported() {
        let card = RamCard::blank(16);
        assert_eq!(space_info(&card), Err(QueryError::Unsupported));
    }
}

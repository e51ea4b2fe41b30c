//! In-memory card and bus for host builds and tests.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};
use log::debug;
use thiserror_no_std::Error;

use super::{FormatError, StorageBus, fat};
use crate::config::SpiPins;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamCardError {
    #[error("block index out of range")]
    OutOfRange,
    #[error("card already attached")]
    AlreadyAttached,
    #[error("bus unavailable")]
    BusUnavailable,
    #[error("bus release failed")]
    ReleaseFailed,
}

/// A card backed by a vector of 512-byte blocks.
#[derive(Debug)]
pub struct RamCard {
    blocks: RefCell<Vec<[u8; 512]>>,
}

impl RamCard {
    /// 4 MiB.
    pub const DEFAULT_BLOCKS: usize = 8192;

    /// An all-zero card with no partition table.
    pub fn blank(num_blocks: usize) -> Self {
        Self {
            blocks: RefCell::new(vec![[0u8; 512]; num_blocks]),
        }
    }

    pub fn formatted(num_blocks: usize, allocation_unit_size: u32) -> Result<Self, FormatError> {
        let card = Self::blank(num_blocks);
        fat::format(&card, allocation_unit_size)?;
        Ok(card)
    }
}

impl BlockDevice for RamCard {
    type Error = RamCardError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let card = self.blocks.borrow();
        let start = start_block_idx.0 as usize;
        let source = card
            .get(start..start + blocks.len())
            .ok_or(RamCardError::OutOfRange)?;

        for (block, data) in blocks.iter_mut().zip(source) {
            block.contents.copy_from_slice(data);
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut card = self.blocks.borrow_mut();
        let start = start_block_idx.0 as usize;
        let target = card
            .get_mut(start..start + blocks.len())
            .ok_or(RamCardError::OutOfRange)?;

        for (data, block) in target.iter_mut().zip(blocks) {
            data.copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        let len = self.blocks.borrow().len();
        Ok(BlockCount(u32::try_from(len).unwrap_or(u32::MAX)))
    }
}

/// A bus with one [`RamCard`] in the slot.
#[derive(Debug)]
pub struct RamBus {
    card: Option<RamCard>,
    attached: bool,
    fail_attach: bool,
    fail_release: bool,
    formats: u32,
}

impl RamBus {
    pub fn new(card: RamCard) -> Self {
        Self {
            card: Some(card),
            attached: false,
            fail_attach: false,
            fail_release: false,
            formats: 0,
        }
    }

    /// Make every `attach` fail.
    pub fn with_attach_failure(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    /// Make every `release` fail. The card stays attached.
    pub fn with_release_failure(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The card, while it sits in the slot unattached.
    pub fn card(&self) -> Option<&RamCard> {
        if self.attached {
            None
        } else {
            self.card.as_ref()
        }
    }

    /// Successful formats so far.
    pub fn format_count(&self) -> u32 {
        self.formats
    }
}

impl StorageBus for RamBus {
    type Card = RamCard;
    type Error = RamCardError;

    fn attach(&mut self, pins: &SpiPins) -> Result<Self::Card, Self::Error> {
        if self.fail_attach {
            return Err(RamCardError::BusUnavailable);
        }
        let card = self.card.take().ok_or(RamCardError::AlreadyAttached)?;
        self.attached = true;
        debug!("RAM bus: card attached on CS={}", pins.cs);
        Ok(card)
    }

    fn format(&mut self, card: &Self::Card, allocation_unit_size: u32) -> Result<(), FormatError> {
        fat::format(card, allocation_unit_size)?;
        self.formats += 1;
        Ok(())
    }

    fn release(&mut self, card: Self::Card) -> Result<(), Self::Error> {
        self.card = Some(card);
        if self.fail_release {
            return Err(RamCardError::ReleaseFailed);
        }
        self.attached = false;
        debug!("RAM bus: card released");
        Ok(())
    }
}

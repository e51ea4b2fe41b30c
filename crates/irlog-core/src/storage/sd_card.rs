use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use embedded_sdmmc::{
    Block, BlockCount, BlockDevice, BlockIdx, Directory, Mode, SdCard, TimeSource, VolumeIdx,
    VolumeManager,
};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::error::Fault;
use super::{
    AppendError, CreateError, DeleteError, EVENT_LOG_PATH, FormatError, Lines, MOUNT_POINT,
    MountError, QueryError, ReadError, SpaceInfo, UnmountStatus, WriteError, fat, short_name,
};
use crate::config::{MAX_OPEN_FILES, MountOptions, SpiPins};

const MAX_DIRS: usize = 4;
const MAX_VOLUMES: usize = 1;

/// Bytes pulled from the card per read call.
const READ_CHUNK: usize = 64;

/// The four-wire bus the card is attached to.
///
/// `attach` and `release` bracket a session: whatever `attach` hands out is
/// given back through `release` on unmount, or on a failed mount, after which
/// the bus can be attached again.
pub trait StorageBus {
    type Card: BlockDevice;
    type Error: core::fmt::Debug;

    /// Claim the bus on `pins` and attach the card.
    fn attach(&mut self, pins: &SpiPins) -> Result<Self::Card, Self::Error>;

    /// Write a fresh FAT volume to the card.
    fn format(&mut self, card: &Self::Card, allocation_unit_size: u32) -> Result<(), FormatError> {
        fat::format(card, allocation_unit_size)
    }

    /// Detach the card and free the bus.
    fn release(&mut self, card: Self::Card) -> Result<(), Self::Error>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiCardBusError {
    #[error("card already attached")]
    AlreadyAttached,
}

/// An SD card in SPI mode on an `embedded-hal` SPI device.
///
/// The bus keeps the card driver; `attach` hands out a handle to it and
/// forces the card through its init sequence again on first access.
pub struct SpiCardBus<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    card: Rc<SdCard<S, D>>,
}

impl<S, D> SpiCardBus<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    pub fn new(spi: S, delay: D) -> Self {
        Self {
            card: Rc::new(SdCard::new(spi, delay)),
        }
    }
}

impl<S, D> StorageBus for SpiCardBus<S, D>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    type Card = CardHandle<SdCard<S, D>>;
    type Error = SpiCardBusError;

    fn attach(&mut self, pins: &SpiPins) -> Result<Self::Card, Self::Error> {
        if Rc::strong_count(&self.card) > 1 {
            return Err(SpiCardBusError::AlreadyAttached);
        }
        debug!(
            "SD: attaching card (CLK={}, MOSI={}, MISO={}, CS={})",
            pins.clk, pins.mosi, pins.miso, pins.cs
        );
        self.card.mark_card_uninit();
        Ok(CardHandle(self.card.clone()))
    }

    fn release(&mut self, card: Self::Card) -> Result<(), Self::Error> {
        drop(card);
        Ok(())
    }
}

/// A shared reference to a card, usable wherever the card is.
pub struct CardHandle<C>(Rc<C>);

impl<C: BlockDevice> BlockDevice for CardHandle<C> {
    type Error = C::Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.read(blocks, start_block_idx)
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.0.write(blocks, start_block_idx)
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        self.0.num_blocks()
    }
}

type CardVolumeManager<C, T> =
    VolumeManager<CardHandle<C>, T, MAX_DIRS, MAX_OPEN_FILES, MAX_VOLUMES>;

type RootDir<'a, C, T> = Directory<'a, CardHandle<C>, T, MAX_DIRS, MAX_OPEN_FILES, MAX_VOLUMES>;

type SdError<C> = embedded_sdmmc::Error<<C as BlockDevice>::Error>;

struct Mounted<C, T>
where
    C: BlockDevice,
    T: TimeSource,
{
    volume_mgr: CardVolumeManager<C, T>,
    card: Rc<C>,
}

/// A mounted card.
///
/// Every file operation opens the volume, the root directory and the file it
/// needs and closes all three before returning, so no handle outlives a call.
/// After [`StorageSession::unmount`] every operation reports `NotMounted`.
pub struct StorageSession<C, T>
where
    C: BlockDevice,
    T: TimeSource,
{
    mounted: Option<Mounted<C, T>>,
}

impl<C, T> StorageSession<C, T>
where
    C: BlockDevice,
    T: TimeSource,
{
    /// Attach the card on `bus` and mount its first FAT volume at [`MOUNT_POINT`].
    ///
    /// A failed mount hands the card back to the bus before returning.
    pub fn mount<B>(
        bus: &mut B,
        pins: SpiPins,
        options: MountOptions,
        clock: T,
    ) -> Result<Self, MountError>
    where
        B: StorageBus<Card = C>,
    {
        if !options.is_valid() {
            error!("SD: invalid mount options {:?}", options);
            return Err(MountError::InvalidOptions);
        }
        if !pins.is_valid() {
            error!("SD: invalid bus pins {:?}", pins);
            return Err(MountError::BusInitFailed);
        }

        let card = bus.attach(&pins).map_err(|e| {
            error!("SD: failed to initialise bus: {:?}", e);
            MountError::BusInitFailed
        })?;
        let card = Rc::new(card);

        let volume_mgr = VolumeManager::new(CardHandle(card.clone()), clock);
        let volume_mgr = match Self::open_volume0(&volume_mgr) {
            Ok(()) => volume_mgr,
            Err(e) if options.format_if_mount_failed => {
                warn!("SD: mount failed ({:?}), formatting card", e);
                let (shared, clock) = volume_mgr.free();
                drop(shared);

                if let Err(e) = bus.format(&card, options.allocation_unit_size) {
                    error!("SD: format failed: {:?}", e);
                    Self::give_back(bus, card);
                    return Err(MountError::MountFailed);
                }

                let volume_mgr = VolumeManager::new(CardHandle(card.clone()), clock);
                if let Err(e) = Self::open_volume0(&volume_mgr) {
                    error!("SD: mount after format failed: {:?}", e);
                    drop(volume_mgr);
                    Self::give_back(bus, card);
                    return Err(MountError::MountFailed);
                }
                volume_mgr
            }
            Err(e) => {
                error!("SD: mount failed: {:?}", e);
                drop(volume_mgr);
                Self::give_back(bus, card);
                return Err(MountError::MountFailed);
            }
        };

        match card.num_blocks() {
            Ok(blocks) => info!(
                "SD: card mounted at {} ({} MiB)",
                MOUNT_POINT,
                u64::from(blocks.0) * u64::from(fat::BLOCK_LEN) / (1024 * 1024)
            ),
            Err(e) => warn!("SD: card mounted at {}, size unknown: {:?}", MOUNT_POINT, e),
        }

        Ok(Self {
            mounted: Some(Mounted { volume_mgr, card }),
        })
    }

    fn open_volume0(volume_mgr: &CardVolumeManager<C, T>) -> Result<(), SdError<C>> {
        let volume = volume_mgr.open_volume(VolumeIdx(0))?;
        volume.close()
    }

    /// Return the card to the bus after the volume manager let go of it.
    fn give_back<B>(bus: &mut B, card: Rc<C>)
    where
        B: StorageBus<Card = C>,
    {
        match Rc::into_inner(card) {
            Some(card) => {
                if let Err(e) = bus.release(card) {
                    error!("SD: failed to release bus: {:?}", e);
                }
            }
            None => error!("SD: card still shared, bus not released"),
        }
    }

    /// `true` while the session holds a mounted volume.
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Run `f` against the root directory of volume 0, closing both afterwards.
    fn in_root_dir<R>(
        volume_mgr: &CardVolumeManager<C, T>,
        f: impl FnOnce(&RootDir<'_, C, T>) -> Result<R, SdError<C>>,
    ) -> Result<R, SdError<C>> {
        let volume = volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume.open_root_dir()?;

        let result = f(&root_dir);

        root_dir.close()?;
        volume.close()?;
        result
    }

    fn volume_mgr(&self) -> Option<&CardVolumeManager<C, T>> {
        self.mounted.as_ref().map(|m| &m.volume_mgr)
    }

    /// Check for a file by opening it read-only.
    ///
    /// Anything that prevents opening counts as "does not exist".
    pub fn file_exists(&self, path: &str) -> bool {
        let (Some(volume_mgr), Some(name)) = (self.volume_mgr(), short_name(path)) else {
            return false;
        };

        Self::in_root_dir(volume_mgr, |dir| {
            dir.open_file_in_dir(name.as_str(), Mode::ReadOnly)?.close()
        })
        .is_ok()
    }

    /// Create an empty file, truncating any existing one.
    pub fn create_file(&self, path: &str) -> Result<(), CreateError> {
        let volume_mgr = self.volume_mgr().ok_or(CreateError::NotMounted)?;
        let name = short_name(path).ok_or(CreateError::InvalidPath)?;

        Self::in_root_dir(volume_mgr, |dir| {
            dir.open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)?
                .close()
        })
        .map_err(|e| Fault::log("create", path, e))?;

        debug!("SD: created {}", path);
        Ok(())
    }

    /// Replace the contents of `path` with exactly `content`.
    pub fn write(&self, path: &str, content: &[u8]) -> Result<(), WriteError> {
        let volume_mgr = self.volume_mgr().ok_or(WriteError::NotMounted)?;
        let name = short_name(path).ok_or(WriteError::InvalidPath)?;

        Self::in_root_dir(volume_mgr, |dir| {
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)?;
            file.write(content)?;
            file.close()
        })
        .map_err(|e| Fault::log("write", path, e))?;

        debug!("SD: wrote {} bytes to {}", content.len(), path);
        Ok(())
    }

    /// Read the whole file as text lines.
    pub fn read(&self, path: &str) -> Result<Lines, ReadError> {
        let volume_mgr = self.volume_mgr().ok_or(ReadError::NotMounted)?;
        let name = short_name(path).ok_or(ReadError::InvalidPath)?;

        let bytes = Self::in_root_dir(volume_mgr, |dir| {
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadOnly)?;

            let mut bytes = Vec::new();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let read = file.read(&mut chunk)?;
                if read == 0 {
                    break; // EOF
                }
                bytes.extend_from_slice(&chunk[..read]);
            }

            file.close()?;
            Ok(bytes)
        })
        .map_err(|e| Fault::log("read", path, e))?;

        debug!("SD: read {} bytes from {}", bytes.len(), path);
        Ok(Lines::new(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Append `content` and a line terminator to an existing file.
    ///
    /// The file is never created here; appending to a missing file fails
    /// with [`AppendError::NotFound`].
    pub fn append(&self, path: &str, content: &str) -> Result<(), AppendError> {
        let volume_mgr = self.volume_mgr().ok_or(AppendError::NotMounted)?;
        let name = short_name(path).ok_or(AppendError::InvalidPath)?;

        Self::in_root_dir(volume_mgr, |dir| {
            let file = dir.open_file_in_dir(name.as_str(), Mode::ReadWriteAppend)?;
            file.write(content.as_bytes())?;
            file.write(b"\n")?;
            file.close()
        })
        .map_err(|e| Fault::log("append", path, e))?;

        debug!("SD: appended {} bytes to {}", content.len() + 1, path);
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<(), DeleteError> {
        let volume_mgr = self.volume_mgr().ok_or(DeleteError::NotMounted)?;
        let name = short_name(path).ok_or(DeleteError::InvalidPath)?;

        Self::in_root_dir(volume_mgr, |dir| dir.delete_file_in_dir(name.as_str()))
            .map_err(|e| Fault::log("delete", path, e))?;

        debug!("SD: deleted {}", path);
        Ok(())
    }

    /// Capacity and free space of the mounted volume.
    pub fn space_info(&self) -> Result<SpaceInfo, QueryError> {
        let mounted = self.mounted.as_ref().ok_or(QueryError::NotMounted)?;
        fat::space_info(&*mounted.card)
    }

    /// Append `"<tag>: <message>"` to the card's event log, creating it first
    /// if needed.
    pub fn log_event(&self, tag: &str, message: &str) -> Result<(), AppendError> {
        if !self.file_exists(EVENT_LOG_PATH) {
            self.create_file(EVENT_LOG_PATH)?;
        }
        self.append(EVENT_LOG_PATH, &format!("{}: {}", tag, message))
    }

    /// Tear down the volume manager and release the bus.
    ///
    /// Calling this again on an unmounted session is a no-op.
    pub fn unmount<B>(&mut self, bus: &mut B) -> UnmountStatus
    where
        B: StorageBus<Card = C>,
    {
        let Some(Mounted { volume_mgr, card }) = self.mounted.take() else {
            return UnmountStatus::AlreadyUnmounted;
        };

        let (shared, _clock) = volume_mgr.free();
        drop(shared);

        let Some(card) = Rc::into_inner(card) else {
            warn!("SD: card still shared, bus not released");
            return UnmountStatus::BusReleaseFailed;
        };

        match bus.release(card) {
            Ok(()) => {
                info!("SD: card unmounted");
                UnmountStatus::Unmounted
            }
            Err(e) => {
                warn!("SD: unmounted, but bus release failed: {:?}", e);
                UnmountStatus::BusReleaseFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FixedTimeSource, RamBus, RamCard};
    use alloc::vec::Vec;

    const PINS: SpiPins = SpiPins::new(12, 11, 13, 10);
    const LOG_PATH: &str = "/sdcard/MLX90614.txt";

    type Session = StorageSession<RamCard, FixedTimeSource>;

    fn mounted() -> (Session, RamBus) {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));
        let session = Session::mount(
            &mut bus,
            PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        )
        .unwrap();
        (session, bus)
    }

    fn lines(session: &Session, path: &str) -> Vec<String> {
        session
            .read(path)
            .unwrap()
            .iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_mount_formats_blank_card() {
        let (session, bus) = mounted();
        assert!(session.is_mounted());
        assert!(bus.is_attached());
        assert_eq!(bus.format_count(), 1);
    }

    #[test]
    fn test_mount_existing_volume_skips_format() {
        let card = RamCard::formatted(RamCard::DEFAULT_BLOCKS, 512).unwrap();
        let mut bus = RamBus::new(card);
        let options = MountOptions::default().with_format_if_mount_failed(false);

        let session = Session::mount(&mut bus, PINS, options, FixedTimeSource::default());

        assert!(session.is_ok());
        assert_eq!(bus.format_count(), 0);
    }

    #[test]
    fn test_mount_failure_releases_bus() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));
        let options = MountOptions::default().with_format_if_mount_failed(false);

        let result = Session::mount(&mut bus, PINS, options, FixedTimeSource::default());

        assert_eq!(result.err(), Some(MountError::MountFailed));
        assert!(!bus.is_attached());
        assert!(bus.card().is_some());
        assert_eq!(bus.format_count(), 0);
    }

    #[test]
    fn test_mount_fails_when_format_fails() {
        // Too small for any FAT volume
        let mut bus = RamBus::new(RamCard::blank(64));

        let result = Session::mount(
            &mut bus,
            PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        );

        assert_eq!(result.err(), Some(MountError::MountFailed));
        assert!(!bus.is_attached());
    }

    #[test]
    fn test_bus_init_failure() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS)).with_attach_failure();

        let result = Session::mount(
            &mut bus,
            PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        );

        assert_eq!(result.err(), Some(MountError::BusInitFailed));
        assert_eq!(bus.format_count(), 0);
    }

    #[test]
    fn test_invalid_pins_and_options() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));

        let bad_pins = SpiPins::new(12, 12, 13, 10);
        let result = Session::mount(
            &mut bus,
            bad_pins,
            MountOptions::default(),
            FixedTimeSource::default(),
        );
        assert_eq!(result.err(), Some(MountError::BusInitFailed));

        let bad_options = MountOptions::default().with_max_open_files(16);
        let result = Session::mount(&mut bus, PINS, bad_options, FixedTimeSource::default());
        assert_eq!(result.err(), Some(MountError::InvalidOptions));

        assert!(!bus.is_attached());
    }

    #[test]
    fn test_write_then_read() {
        let (session, _bus) = mounted();

        session.write(LOG_PATH, b"X").unwrap();

        assert_eq!(lines(&session, LOG_PATH), ["X"]);
    }

    #[test]
    fn test_write_overwrites() {
        let (session, _bus) = mounted();

        session.write(LOG_PATH, b"first\nsecond\n").unwrap();
        session.write(LOG_PATH, b"third").unwrap();

        assert_eq!(lines(&session, LOG_PATH), ["third"]);
    }

    #[test]
    fn test_read_is_restartable() {
        let (session, _bus) = mounted();
        session.write(LOG_PATH, b"a\nb\n").unwrap();

        let read = session.read(LOG_PATH).unwrap();

        assert_eq!(read.iter().count(), 2);
        assert_eq!(read.iter().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!((&read).into_iter().last(), Some("b"));
    }

    #[test]
    fn test_read_spans_clusters() {
        let (session, _bus) = mounted();
        let line = "celsius=21.37";
        session.create_file(LOG_PATH).unwrap();
        for _ in 0..100 {
            session.append(LOG_PATH, line).unwrap();
        }

        let read = lines(&session, LOG_PATH);
        assert_eq!(read.len(), 100);
        assert!(read.iter().all(|l| l == line));
    }

    #[test]
    fn test_read_missing_file() {
        let (session, _bus) = mounted();
        assert_eq!(session.read(LOG_PATH).err(), Some(ReadError::NotFound));
    }

    #[test]
    fn test_file_exists_is_idempotent() {
        let (session, _bus) = mounted();

        assert!(!session.file_exists(LOG_PATH));
        assert!(!session.file_exists(LOG_PATH));

        session.write(LOG_PATH, b"X").unwrap();

        assert!(session.file_exists(LOG_PATH));
        assert!(session.file_exists(LOG_PATH));
        assert_eq!(lines(&session, LOG_PATH), ["X"]);
    }

    #[test]
    fn test_paths_are_case_insensitive() {
        let (session, _bus) = mounted();
        session.write("/sdcard/mlx90614.txt", b"X").unwrap();
        assert!(session.file_exists("/sdcard/MLX90614.TXT"));
    }

    #[test]
    fn test_invalid_paths() {
        let (session, _bus) = mounted();

        assert_eq!(session.create_file("/other/A.TXT"), Err(CreateError::InvalidPath));
        assert_eq!(session.create_file("/sdcard/logs/A.TXT"), Err(CreateError::InvalidPath));
        assert_eq!(session.write("/sdcard/", b"X"), Err(WriteError::InvalidPath));
        assert_eq!(
            session.write("/sdcard/NINECHARS.TXT", b"X"),
            Err(WriteError::InvalidPath)
        );
        assert!(!session.file_exists("MLX90614.TXT"));
    }

    #[test]
    fn test_append_requires_existing_file() {
        let (session, _bus) = mounted();

        assert_eq!(session.append(LOG_PATH, "celsius=20.00"), Err(AppendError::NotFound));
        assert!(!session.file_exists(LOG_PATH));
    }

    #[test]
    fn test_append_preserves_order() {
        let (session, _bus) = mounted();
        session.create_file(LOG_PATH).unwrap();

        session.append(LOG_PATH, "celsius=20.00").unwrap();
        session.append(LOG_PATH, "celsius=20.50").unwrap();
        session.append(LOG_PATH, "celsius=21.00").unwrap();

        assert_eq!(
            lines(&session, LOG_PATH),
            ["celsius=20.00", "celsius=20.50", "celsius=21.00"]
        );
    }

    #[test]
    fn test_create_truncates() {
        let (session, _bus) = mounted();
        session.write(LOG_PATH, b"old").unwrap();

        session.create_file(LOG_PATH).unwrap();

        assert!(session.read(LOG_PATH).unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let (session, _bus) = mounted();

        assert_eq!(session.delete(LOG_PATH), Err(DeleteError::NotFound));

        session.create_file(LOG_PATH).unwrap();
        session.delete(LOG_PATH).unwrap();

        assert!(!session.file_exists(LOG_PATH));
        assert_eq!(session.delete(LOG_PATH), Err(DeleteError::NotFound));
    }

    #[test]
    fn test_space_info() {
        let (session, _bus) = mounted();

        let fresh = session.space_info().unwrap();
        assert!(fresh.total_bytes > 0);
        assert_eq!(fresh.free_bytes, fresh.total_bytes);

        session.write(LOG_PATH, &[b'x'; 1000]).unwrap();

        let used = session.space_info().unwrap();
        assert_eq!(used.total_bytes, fresh.total_bytes);
        let consumed = fresh.free_bytes - used.free_bytes;
        assert!((1000..=2048).contains(&consumed), "consumed {}", consumed);
    }

    #[test]
    fn test_log_event_creates_file() {
        let (session, _bus) = mounted();

        session.log_event("SD_CARD", "Total Space: 3.00 MB").unwrap();
        session.log_event("SD_CARD", "Free Space: 3.00 MB").unwrap();

        assert_eq!(
            lines(&session, EVENT_LOG_PATH),
            ["SD_CARD: Total Space: 3.00 MB", "SD_CARD: Free Space: 3.00 MB"]
        );
    }

    #[test]
    fn test_data_survives_remount() {
        let (mut session, mut bus) = mounted();
        session.create_file(LOG_PATH).unwrap();
        session.append(LOG_PATH, "celsius=22.00").unwrap();
        assert_eq!(session.unmount(&mut bus), UnmountStatus::Unmounted);

        let options = MountOptions::default().with_format_if_mount_failed(false);
        let session = Session::mount(&mut bus, PINS, options, FixedTimeSource::default()).unwrap();

        assert_eq!(lines(&session, LOG_PATH), ["celsius=22.00"]);
    }

    #[test]
    fn test_operations_after_unmount() {
        let (mut session, mut bus) = mounted();
        session.write(LOG_PATH, b"X").unwrap();

        assert_eq!(session.unmount(&mut bus), UnmountStatus::Unmounted);
        assert!(!bus.is_attached());
        assert!(!session.is_mounted());

        assert!(!session.file_exists(LOG_PATH));
        assert_eq!(session.create_file(LOG_PATH), Err(CreateError::NotMounted));
        assert_eq!(session.write(LOG_PATH, b"X"), Err(WriteError::NotMounted));
        assert_eq!(session.read(LOG_PATH).err(), Some(ReadError::NotMounted));
        assert_eq!(session.append(LOG_PATH, "X"), Err(AppendError::NotMounted));
        assert_eq!(session.delete(LOG_PATH), Err(DeleteError::NotMounted));
        assert_eq!(session.space_info().err(), Some(QueryError::NotMounted));
        assert_eq!(session.log_event("T", "m"), Err(AppendError::NotMounted));

        assert_eq!(session.unmount(&mut bus), UnmountStatus::AlreadyUnmounted);
    }

    #[test]
    fn test_bus_release_failure_is_reported() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS)).with_release_failure();
        let mut session = Session::mount(
            &mut bus,
            PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        )
        .unwrap();

        assert_eq!(session.unmount(&mut bus), UnmountStatus::BusReleaseFailed);
        assert!(!session.is_mounted());
        assert_eq!(session.unmount(&mut bus), UnmountStatus::AlreadyUnmounted);
    }

    #[test]
    fn test_fat32_card_round_trip() {
        let mut bus = RamBus::new(RamCard::blank(70_000));
        let options = MountOptions::default().with_allocation_unit_size(512);
        let mut session = Session::mount(&mut bus, PINS, options, FixedTimeSource::default()).unwrap();

        let fresh = session.space_info().unwrap();
        session.create_file(LOG_PATH).unwrap();
        session.append(LOG_PATH, "celsius=19.50").unwrap();
        session.append(LOG_PATH, "celsius=19.75").unwrap();

        assert_eq!(lines(&session, LOG_PATH), ["celsius=19.50", "celsius=19.75"]);
        // One 512-byte cluster of data
        let used = session.space_info().unwrap();
        assert_eq!(fresh.free_bytes - used.free_bytes, 512);
        assert_eq!(session.unmount(&mut bus), UnmountStatus::Unmounted);
    }

    #[test]
    fn test_single_open_file_is_enough() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));
        let options = MountOptions::default().with_max_open_files(1);
        let session = Session::mount(&mut bus, PINS, options, FixedTimeSource::default()).unwrap();

        session.create_file(LOG_PATH).unwrap();
        session.append(LOG_PATH, "celsius=20.00").unwrap();
        session.log_event("SD_CARD", "ready").unwrap();
        assert!(session.file_exists(LOG_PATH));
        assert_eq!(lines(&session, LOG_PATH), ["celsius=20.00"]);
        session.delete(LOG_PATH).unwrap();
    }

    // A card slot with nothing answering on the SPI lines.
    struct DeadSpi;

    impl embedded_hal::spi::ErrorType for DeadSpi {
        type Error = embedded_hal::spi::ErrorKind;
    }

    impl embedded_hal::spi::SpiDevice<u8> for DeadSpi {
        fn transaction(
            &mut self,
            _operations: &mut [embedded_hal::spi::Operation<'_, u8>],
        ) -> Result<(), Self::Error> {
            Err(embedded_hal::spi::ErrorKind::Other)
        }
    }

    struct NoDelay;

    impl embedded_hal::delay::DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    type SpiSession = StorageSession<CardHandle<SdCard<DeadSpi, NoDelay>>, FixedTimeSource>;

    #[test]
    fn test_spi_bus_remounts_after_failed_mount() {
        let mut bus = SpiCardBus::new(DeadSpi, NoDelay);
        let options = MountOptions::default().with_format_if_mount_failed(false);

        let first = SpiSession::mount(&mut bus, PINS, options, FixedTimeSource::default());
        let second = SpiSession::mount(&mut bus, PINS, options, FixedTimeSource::default());

        assert_eq!(first.err(), Some(MountError::MountFailed));
        assert_eq!(second.err(), Some(MountError::MountFailed));
    }

    #[test]
    fn test_spi_bus_formats_through_card() {
        let mut bus = SpiCardBus::new(DeadSpi, NoDelay);

        let card = bus.attach(&PINS).unwrap();
        assert_eq!(bus.attach(&PINS).err(), Some(SpiCardBusError::AlreadyAttached));
        assert_eq!(bus.format(&card, 16 * 1024), Err(FormatError::Device));
        bus.release(card).unwrap();

        assert!(bus.attach(&PINS).is_ok());
    }

    #[test]
    fn test_spi_bus_format_on_mount_failure() {
        let mut bus = SpiCardBus::new(DeadSpi, NoDelay);

        let result = SpiSession::mount(
            &mut bus,
            PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        );

        assert_eq!(result.err(), Some(MountError::MountFailed));
        assert!(bus.attach(&PINS).is_ok());
    }
}

use core::fmt::Write;

use embedded_sdmmc::{
    DirEntry, Error, Mode, SdCard, SdCardError, TimeSource, VolumeIdx, VolumeManager,
};

use super::{FileName, LogStore, WriteMode};

const READ_CHUNK: usize = 128;

/// The dataset log on a FAT formatted SD card, root directory of volume 0.
///
/// SD card operations are blocking. Every call opens the volume, does its
/// work and closes everything again, so no handle outlives a call and a
/// sudden deep sleep cannot leave unflushed data behind.
pub struct SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
}

impl<S, D, T> SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self { volume_mgr }
    }
}

impl<S, D, T> LogStore for SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    type Error = Error<SdCardError>;

    fn list_files(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        root_dir.iterate_dir(|entry: &DirEntry| {
            if entry.attributes.is_directory() {
                return;
            }
            // Short names print as `BASE.EXT`
            let mut name = FileName::new();
            if write!(name, "{}", entry.name).is_ok() {
                visit(&name);
            }
        })?;

        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }

    fn read_file(
        &mut self,
        name: &str,
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<bool, Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let file = match root_dir.open_file_in_dir(name, Mode::ReadOnly) {
            Ok(file) => file,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut chunk = [0u8; READ_CHUNK];
        while !file.is_eof() {
            let bytes_read = file.read(&mut chunk)?;
            if bytes_read == 0 {
                break;
            }
            visit(&chunk[..bytes_read]);
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(true)
    }

    fn write_file(&mut self, name: &str, mode: WriteMode, data: &[u8]) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let mode = match mode {
            WriteMode::Truncate => Mode::ReadWriteCreateOrTruncate,
            WriteMode::Append => Mode::ReadWriteCreateOrAppend,
        };
        let file = root_dir.open_file_in_dir(name, mode)?;

        file.write(data)?;
        file.flush()?;

        // Dropping would close as well, but only an explicit close reports
        // errors
        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }
}

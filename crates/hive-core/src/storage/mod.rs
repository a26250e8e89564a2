//! Durable dataset log on the SD card.
//!
//! Batches are appended as one text line per dataset to rotating segment
//! files. Every line starts with the global dataset counter, which is how the
//! counter is recovered after deep sleep or power loss without a separate
//! write per sample.
//!
//! ## File layout
//!
//! - Segment files live in the root directory: `BEE` + 5 hex digits +
//!   `.TXT`, which is the FAT 8.3 short name limit (8 character stem)
//! - Line: `#<8 hex counter>,` then per reading
//!   `<2 hex bus><2 hex address>,<4 hex raw humidity>,<4 hex raw temperature>,`
//!   and `\r\n`
//! - Runtime settings: `SETTINGS.BIN`, a postcard blob

mod dataset_log;
mod memory;
mod recovery;
mod settings_file;
#[cfg(feature = "sd-card")]
pub mod sd_card;

pub use dataset_log::*;
pub use memory::*;
pub use recovery::*;
pub use settings_file::*;

use core::fmt::Write;

/// Upper-case prefix of every segment file name.
pub const FILE_PREFIX: &str = "BEE";
/// FAT short names allow 8 characters before the extension.
pub const STEM_LEN: usize = 8;
pub const INDEX_DIGITS: usize = STEM_LEN - FILE_PREFIX.len();
pub const INDEX_MASK: u32 = (1 << (4 * INDEX_DIGITS)) - 1;
/// FAT stores short names upper-case.
pub const FILE_EXTENSION: &str = "TXT";

/// A short file name such as `BEE0001F.TXT`.
pub type FileName = heapless::String<12>;

/// How a write opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create the file, discarding any previous content.
    Truncate,
    /// Create the file if needed and append.
    Append,
}

/// Flat directory of files backing the log.
///
/// Every write is complete (flushed and closed) when it returns; nothing is
/// buffered across calls.
pub trait LogStore {
    type Error: core::fmt::Debug;

    /// Call `visit` with the name of every file in the log directory.
    fn list_files(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), Self::Error>;

    /// Stream the content of `name` to `visit` in chunks.
    ///
    /// Returns `Ok(false)` if the file does not exist.
    fn read_file(&mut self, name: &str, visit: &mut dyn FnMut(&[u8]))
    -> Result<bool, Self::Error>;

    fn write_file(&mut self, name: &str, mode: WriteMode, data: &[u8])
    -> Result<(), Self::Error>;
}

/// File name of segment `index`, masked to the digits the name can hold.
pub fn segment_file_name(index: u32) -> FileName {
    let mut name = FileName::new();
    // 3 + 5 + 4 characters always fit into 12
    let _ = write!(
        name,
        "{}{:0width$X}.{}",
        FILE_PREFIX,
        index & INDEX_MASK,
        FILE_EXTENSION,
        width = INDEX_DIGITS
    );
    name
}

/// Segment index encoded in `name`, or `None` if it is not a segment file.
pub fn parse_segment_index(name: &str) -> Option<u32> {
    let (stem, extension) = name.split_once('.')?;
    if stem.len() != STEM_LEN || !extension.eq_ignore_ascii_case(FILE_EXTENSION) {
        return None;
    }
    let (prefix, digits) = stem.split_at_checked(FILE_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(FILE_PREFIX) || !digits.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

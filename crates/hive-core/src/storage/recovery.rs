use alloc::vec::Vec;
use log::{debug, info};

use super::{LogStore, parse_segment_index, segment_file_name};

/// Line marker that starts every dataset line.
pub const LINE_MARKER: u8 = b'#';
/// `#` + 8 hex digits + `,`
pub const MIN_LINE_LEN: usize = 10;
const COUNTER_DIGITS: usize = 8;

/// State of the log as found on the card at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveredLog {
    /// Highest dataset counter found; 0 on an empty or unreadable log
    pub counter: u64,
    /// Highest segment index present
    pub segment: Option<u32>,
    /// Complete lines already in that segment
    pub lines_in_segment: usize,
    /// The segment ends in a line without its terminator
    pub torn_tail: bool,
}

/// Counter value of one line, if the line is well-formed.
///
/// A line is well-formed when it starts with [`LINE_MARKER`], is at least
/// [`MIN_LINE_LEN`] bytes long and carries 8 hex digits after the marker.
pub fn parse_line_counter(line: &[u8]) -> Option<u64> {
    if line.len() < MIN_LINE_LEN || line[0] != LINE_MARKER {
        return None;
    }
    let digits = core::str::from_utf8(&line[1..=COUNTER_DIGITS]).ok()?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Line splitter that works across read chunks. Only the head of each line
/// is kept; that is all the counter parser needs.
#[derive(Default)]
struct LineScanner {
    head: heapless::Vec<u8, MIN_LINE_LEN>,
    len: usize,
    lines: usize,
    max_counter: Option<u64>,
}

impl LineScanner {
    fn feed(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                self.lines += 1;
                self.finish_line();
                continue;
            }
            let _ = self.head.push(byte);
            self.len += 1;
        }
    }

    fn finish_line(&mut self) {
        if self.len >= MIN_LINE_LEN
            && let Some(counter) = parse_line_counter(&self.head)
        {
            self.max_counter = Some(self.max_counter.map_or(counter, |max| max.max(counter)));
        }
        self.head.clear();
        self.len = 0;
    }

    /// A trailing line cut short by power loss still contributes its counter
    /// if the counter made it to the card, but is not counted as a dataset.
    fn finish(mut self) -> (Option<u64>, usize, bool) {
        let torn = self.len > 0;
        self.finish_line();
        (self.max_counter, self.lines, torn)
    }
}

/// Scan one segment for its highest counter, line count and torn tail.
fn scan_segment<S: LogStore>(
    store: &mut S,
    segment: u32,
) -> Result<(Option<u64>, usize, bool), S::Error> {
    let mut scanner = LineScanner::default();
    store.read_file(&segment_file_name(segment), &mut |chunk| scanner.feed(chunk))?;
    Ok(scanner.finish())
}

/// Reconstruct the dataset counter and rotation state from the log.
///
/// Counters only grow, so the highest segment holding a well-formed line
/// carries the highest counter. That is normally the highest segment; when
/// power failed while its first line was written it holds none, and the
/// earlier segments are scanned in descending order instead. Recovery reads
/// but never writes, so it can be repeated any number of times with the same
/// result.
pub fn recover<S: LogStore>(store: &mut S) -> Result<RecoveredLog, S::Error> {
    let mut segments: Vec<u32> = Vec::new();
    store.list_files(&mut |name| {
        if let Some(index) = parse_segment_index(name) {
            debug!("Found log segment {} ({})", name, index);
            segments.push(index);
        }
    })?;
    segments.sort_unstable_by(|a, b| b.cmp(a));

    let Some(&segment) = segments.first() else {
        info!("No log segments found, starting at dataset 0");
        return Ok(RecoveredLog::default());
    };

    let (mut max_counter, lines, torn_tail) = scan_segment(store, segment)?;
    for &earlier in &segments[1..] {
        if max_counter.is_some() {
            break;
        }
        info!(
            "{} holds no complete dataset, scanning {}",
            segment_file_name(segment),
            segment_file_name(earlier)
        );
        max_counter = scan_segment(store, earlier)?.0;
    }

    let recovered = RecoveredLog {
        counter: max_counter.unwrap_or(0),
        segment: Some(segment),
        lines_in_segment: lines,
        torn_tail,
    };
    info!(
        "Recovered dataset counter {} from {} ({} lines)",
        recovered.counter,
        segment_file_name(segment),
        recovered.lines_in_segment
    );
    Ok(recovered)
}

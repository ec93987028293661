//! Segment reader — whole and range-filtered reads over immutable
//! segment files, plus directory listing.
//!
//! Files are memory-mapped (`memmap2`) and walked with a bounds-checked
//! cursor.  Two failure classes are kept apart:
//!
//! - **Structural damage** (a frame length pointing past end of file, an
//!   undecodable header) aborts the read with [`SegmentError::Corrupt`] —
//!   past that point record boundaries are unknowable.
//! - **Payload damage** inside one series block is captured in that
//!   series' [`SeriesReadResult::error`]; the frame length recovers the
//!   boundary and reading continues.
//!
//! [`SegmentReader::list_segments`] is forgiving by design: files that
//! fail to parse are skipped silently (corrupt or half-written leftovers
//! must not take down directory enumeration).

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::encoding;
use crate::types::DataPoint;

use super::{
    SEGMENT_EXTENSION, Segment, SegmentError, SegmentHeader, SeriesBlockHeader, SeriesReadResult,
};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Frame cursor
// ------------------------------------------------------------------------------------------------

/// Bounds-checked walker over `[u32 LE len][payload]` frames in a mapped
/// segment file.
struct FrameCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FrameCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Returns the next frame's payload and advances past it.
    fn next_frame(&mut self) -> Result<&'a [u8], SegmentError> {
        if self.offset + U32_SIZE > self.buf.len() {
            return Err(SegmentError::Corrupt(format!(
                "frame length truncated at offset {}",
                self.offset
            )));
        }
        let mut len_bytes = [0u8; U32_SIZE];
        len_bytes.copy_from_slice(&self.buf[self.offset..self.offset + U32_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = self.offset + U32_SIZE;

        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                SegmentError::Corrupt(format!(
                    "frame of {len} bytes at offset {} exceeds file size {}",
                    self.offset,
                    self.buf.len()
                ))
            })?;

        self.offset = end;
        Ok(&self.buf[start..end])
    }

    /// Advances past the next frame without touching its payload.
    fn skip_frame(&mut self) -> Result<(), SegmentError> {
        self.next_frame().map(|_| ())
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentReader
// ------------------------------------------------------------------------------------------------

/// Read-side access to the segments of one directory.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    /// Directory holding `segment_<id>.seg` files.
    dir: PathBuf,
}

impl SegmentReader {
    /// Creates a reader over `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Reads a whole segment: header, then exactly `series_count` series
    /// blocks.
    ///
    /// Returns the segment metadata and one [`SeriesReadResult`] per
    /// series in on-disk (lexicographic) order.  Structural damage aborts
    /// with [`SegmentError::Corrupt`].
    pub fn read_segment<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(Segment, Vec<SeriesReadResult>), SegmentError> {
        self.read_filtered(path.as_ref(), None)
    }

    /// Reads the slice of a segment overlapping `[start, end]` inclusive.
    ///
    /// Short-circuits to an empty result set when the header's time
    /// bounds are disjoint from the request (the returned `Segment` then
    /// carries an empty series set — only the header was touched).
    /// Series whose filtered point list comes out empty are omitted.
    pub fn read_segment_range<P: AsRef<Path>>(
        &self,
        path: P,
        start: i64,
        end: i64,
    ) -> Result<(Segment, Vec<SeriesReadResult>), SegmentError> {
        self.read_filtered(path.as_ref(), Some((start, end)))
    }

    /// Enumerates `*.seg` files in the directory, returning metadata for
    /// every file that parses.  Unparsable files (corrupt, or a writer's
    /// leftover) are skipped silently.  Sorted by segment ID ascending.
    pub fn list_segments(&self) -> Result<Vec<Segment>, SegmentError> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION)
            {
                continue;
            }
            match self.read_metadata(&path) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable segment");
                }
            }
        }

        segments.sort_by_key(|s| s.id);
        Ok(segments)
    }

    /// Parses a segment's header and series headers without decoding any
    /// point payloads.  Point frames are skipped by length.
    pub fn read_metadata<P: AsRef<Path>>(&self, path: P) -> Result<Segment, SegmentError> {
        let path = path.as_ref();
        let (mmap, size) = map_file(path)?;
        let mut cursor = FrameCursor::new(&mmap);

        let header = read_header(&mut cursor)?;
        let mut series_ids = std::collections::BTreeSet::new();

        for _ in 0..header.series_count {
            let block = read_series_header(&mut cursor)?;
            for _ in 0..block.point_count {
                cursor.skip_frame()?;
            }
            series_ids.insert(block.series_id);
        }

        Ok(segment_from(header, series_ids, path, size))
    }

    /// Directory this reader scans.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared body of [`read_segment`](Self::read_segment) and
    /// [`read_segment_range`](Self::read_segment_range).
    fn read_filtered(
        &self,
        path: &Path,
        range: Option<(i64, i64)>,
    ) -> Result<(Segment, Vec<SeriesReadResult>), SegmentError> {
        let (mmap, size) = map_file(path)?;
        let mut cursor = FrameCursor::new(&mmap);

        let header = read_header(&mut cursor)?;

        if let Some((start, end)) = range {
            if header.max_time < start || header.min_time > end {
                trace!(
                    path = %path.display(),
                    start,
                    end,
                    min_time = header.min_time,
                    max_time = header.max_time,
                    "segment range read short-circuited"
                );
                let segment = segment_from(header, Default::default(), path, size);
                return Ok((segment, Vec::new()));
            }
        }

        let mut series_ids = std::collections::BTreeSet::new();
        let mut results = Vec::with_capacity(header.series_count as usize);

        for _ in 0..header.series_count {
            let block = read_series_header(&mut cursor)?;
            series_ids.insert(block.series_id.clone());

            let mut points = Vec::with_capacity(block.point_count as usize);
            let mut first_error = None;

            for _ in 0..block.point_count {
                let payload = cursor.next_frame()?;
                match encoding::decode_from_slice::<DataPoint>(payload) {
                    Ok((point, _)) => {
                        let keep = match range {
                            Some((start, end)) => {
                                point.timestamp >= start && point.timestamp <= end
                            }
                            None => true,
                        };
                        if keep {
                            points.push(point);
                        }
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(SegmentError::Encoding(e));
                        }
                    }
                }
            }

            // Range reads omit series the filter emptied out.
            if range.is_some() && points.is_empty() {
                continue;
            }

            results.push(SeriesReadResult {
                series_id: block.series_id,
                points,
                error: first_error,
            });
        }

        Ok((segment_from(header, series_ids, path, size), results))
    }
}

// ------------------------------------------------------------------------------------------------
// Parsing helpers
// ------------------------------------------------------------------------------------------------

/// Opens and memory-maps a segment file.
fn map_file(path: &Path) -> Result<(Mmap, u64), SegmentError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    // An immutable, fully-written file; the writer renames into place, so
    // no one mutates the mapping underneath us.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok((mmap, size))
}

/// Reads and decodes the segment header frame.
fn read_header(cursor: &mut FrameCursor<'_>) -> Result<SegmentHeader, SegmentError> {
    let payload = cursor.next_frame()?;
    let (header, _) = encoding::decode_from_slice::<SegmentHeader>(payload)
        .map_err(|e| SegmentError::Corrupt(format!("undecodable segment header: {e}")))?;
    Ok(header)
}

/// Reads and decodes one series block header frame.
fn read_series_header(cursor: &mut FrameCursor<'_>) -> Result<SeriesBlockHeader, SegmentError> {
    let payload = cursor.next_frame()?;
    let (block, _) = encoding::decode_from_slice::<SeriesBlockHeader>(payload)
        .map_err(|e| SegmentError::Corrupt(format!("undecodable series header: {e}")))?;
    Ok(block)
}

/// Assembles in-memory segment metadata from a parsed header.
fn segment_from(
    header: SegmentHeader,
    series_ids: std::collections::BTreeSet<String>,
    path: &Path,
    size: u64,
) -> Segment {
    Segment {
        id: header.id,
        path: path.to_path_buf(),
        size,
        min_time: header.min_time,
        max_time: header.max_time,
        series_ids,
        created_at: header.created_at,
    }
}

//! Wire-format implementations for the segment file structures.
//!
//! Field order is part of the on-disk format and must never change.

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::{SegmentHeader, SeriesBlockHeader};

// ------------------------------------------------------------------------------------------------
// SegmentHeader
// ------------------------------------------------------------------------------------------------

impl Encode for SegmentHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.created_at.encode_to(buf)?;
        self.series_count.encode_to(buf)?;
        self.point_count.encode_to(buf)?;
        self.min_time.encode_to(buf)?;
        self.max_time.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        encoding::encode_map(&self.metadata, buf)?;
        Ok(())
    }
}

impl Decode for SegmentHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (created_at, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (series_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (point_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_time, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_time, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (metadata, n) = encoding::decode_map(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                created_at,
                series_count,
                point_count,
                min_time,
                max_time,
                checksum,
                metadata,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SeriesBlockHeader
// ------------------------------------------------------------------------------------------------

impl Encode for SeriesBlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.series_id.encode_to(buf)?;
        self.point_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SeriesBlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (series_id, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (point_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                series_id,
                point_count,
            },
            offset,
        ))
    }
}

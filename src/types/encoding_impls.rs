//! Wire-format implementations for the core data model.
//!
//! Field order is part of the on-disk format and must never change.

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::DataPoint;

// ------------------------------------------------------------------------------------------------
// DataPoint: [timestamp i64][value f64][labels Option<map>]
// ------------------------------------------------------------------------------------------------

impl Encode for DataPoint {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.timestamp.encode_to(buf)?;
        self.value.encode_to(buf)?;
        match &self.labels {
            None => false.encode_to(buf)?,
            Some(map) => {
                true.encode_to(buf)?;
                encoding::encode_map(map, buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for DataPoint {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (timestamp, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = f64::decode_from(&buf[offset..])?;
        offset += n;
        let (has_labels, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let labels = if has_labels {
            let (map, n) = encoding::decode_map(&buf[offset..])?;
            offset += n;
            Some(map)
        } else {
            None
        };
        Ok((
            Self {
                timestamp,
                value,
                labels,
            },
            offset,
        ))
    }
}

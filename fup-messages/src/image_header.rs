// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::pad_str;
use crate::padded_as_str;
use crate::FieldTooLong;
use crate::FirmwareTarget;
use crate::HubpackError;
use core::fmt;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert;

/// Header at the front of every firmware image file.
///
/// The header occupies the first [`RawImageHeader::BLOCK_SIZE`] bytes of the
/// file (zero padded); the payload that is downloaded to the device follows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct RawImageHeader {
    pub magic: u32,
    pub version: u32,
    pub target: FirmwareTarget,
    pub product_id: [u8; Self::MAX_FIELD_LENGTH],
    pub revision: [u8; Self::MAX_FIELD_LENGTH],
    pub payload_len: u32,
}

const_assert!(RawImageHeader::MAX_SIZE <= RawImageHeader::BLOCK_SIZE);

impl RawImageHeader {
    pub const MAGIC: u32 = 0x4655_5049;
    pub const VERSION: u32 = 1;
    pub const BLOCK_SIZE: usize = 64;
    pub const MAX_FIELD_LENGTH: usize = 16;

    pub fn new(
        target: FirmwareTarget,
        product_id: &str,
        revision: &str,
        payload_len: u32,
    ) -> Result<Self, FieldTooLong> {
        Ok(Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            target,
            product_id: pad_str(product_id)?,
            revision: pad_str(revision)?,
            payload_len,
        })
    }

    pub fn product_id(&self) -> Option<&str> {
        padded_as_str(&self.product_id)
    }

    pub fn revision(&self) -> Option<&str> {
        padded_as_str(&self.revision)
    }

    /// Encode this header into a full (padded) header block.
    pub fn encode(&self) -> Result<[u8; Self::BLOCK_SIZE], HubpackError> {
        let mut block = [0; Self::BLOCK_SIZE];
        hubpack::serialize(&mut block, self)?;
        Ok(block)
    }

    /// Decode and sanity check the header at the front of `data`.
    ///
    /// `data` may be just the header block; the payload length is only
    /// checked by [`RawImageHeader::check_image_len`].
    pub fn decode(data: &[u8]) -> Result<Self, ImageHeaderError> {
        let (header, _) = hubpack::deserialize::<RawImageHeader>(data)
            .map_err(ImageHeaderError::Deserialize)?;

        if header.magic != Self::MAGIC {
            return Err(ImageHeaderError::IncorrectMagic {
                expected: Self::MAGIC,
                got: header.magic,
            });
        }
        if header.version != Self::VERSION {
            return Err(ImageHeaderError::IncorrectVersion {
                expected: Self::VERSION,
                got: header.version,
            });
        }
        if header.product_id().is_none() || header.revision().is_none() {
            return Err(ImageHeaderError::InvalidString);
        }

        Ok(header)
    }

    /// Check that a full image (header block plus payload) has the length
    /// this header claims.
    pub fn check_image_len(
        &self,
        image_len: usize,
    ) -> Result<(), ImageHeaderError> {
        let expected = Self::BLOCK_SIZE as u64 + u64::from(self.payload_len);
        if image_len as u64 != expected {
            return Err(ImageHeaderError::IncorrectDataSize {
                expected,
                got: image_len as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ImageHeaderError {
    Deserialize(HubpackError),
    IncorrectMagic { expected: u32, got: u32 },
    IncorrectVersion { expected: u32, got: u32 },
    InvalidString,
    IncorrectDataSize { expected: u64, got: u64 },
}

impl fmt::Display for ImageHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deserialize(err) => {
                write!(f, "could not deserialize image header: {err}")
            }
            Self::IncorrectMagic { expected, got } => write!(
                f,
                "incorrect magic in image header (expected {expected:#x}, got {got:#x})"
            ),
            Self::IncorrectVersion { expected, got } => write!(
                f,
                "incorrect version in image header (expected {expected}, got {got})"
            ),
            Self::InvalidString => {
                write!(f, "image header contains a non-utf8 string field")
            }
            Self::IncorrectDataSize { expected, got } => write!(
                f,
                "incorrect image size (expected {expected}, got {got})"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_checks_magic() {
        let header =
            RawImageHeader::new(FirmwareTarget::Fpga, "VOYAGER", "1.20", 8)
                .unwrap();
        let mut block = header.encode().unwrap();
        block[0] ^= 0xff;
        assert!(matches!(
            RawImageHeader::decode(&block),
            Err(ImageHeaderError::IncorrectMagic { .. })
        ));
    }

    #[test]
    fn decode_reads_fields() {
        let header =
            RawImageHeader::new(FirmwareTarget::Expander, "VOYAGER", "2.04", 8)
                .unwrap();
        let block = header.encode().unwrap();
        let decoded = RawImageHeader::decode(&block).unwrap();
        assert_eq!(decoded.product_id(), Some("VOYAGER"));
        assert_eq!(decoded.revision(), Some("2.04"));
        assert_eq!(decoded.target, FirmwareTarget::Expander);
        let block = RawImageHeader::BLOCK_SIZE;
        assert!(decoded.check_image_len(block + 8).is_ok());
        assert!(decoded.check_image_len(block).is_err());
    }

    #[test]
    fn new_rejects_long_fields() {
        assert_eq!(
            RawImageHeader::new(
                FirmwareTarget::Main,
                "a-product-id-that-is-too-long",
                "1.0",
                0
            ),
            Err(FieldTooLong { max: RawImageHeader::MAX_FIELD_LENGTH })
        );
    }
}

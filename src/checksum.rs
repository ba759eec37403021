//! # File Checksum Module
//!
//! Streaming file checksum computation. The default CFDP checksum is the modular checksum: the
//! file is interpreted as a sequence of big endian 32-bit words aligned to file offset zero and
//! all words are summed modulo 2^32. A trailing partial word is padded with zeros.
//!
//! The CRC based checksum types of the SANA checksum registry are provided through the
//! [crc] crate, see [crate::CRC_32] and [crate::CRC_32C].
use core::fmt::Debug;

use crc::Digest;
use spacepackets::cfdp::ChecksumType;

use crate::{CRC_32, CRC_32C};

/// Incremental modular checksum.
///
/// Data can be fed in arbitrary slices as long as the slices are contiguous and start at file
/// offset zero.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModularChecksum {
    working: u32,
    result: u32,
    index: u8,
}

impl ModularChecksum {
    pub const fn new() -> Self {
        Self {
            working: 0,
            result: 0,
            index: 0,
        }
    }

    /// Reset the checksum to its initial state.
    pub fn start(&mut self) {
        *self = Self::new();
    }

    pub fn digest(&mut self, data: &[u8]) {
        for byte in data {
            self.working = (self.working << 8) | *byte as u32;
            self.index += 1;
            if self.index == 4 {
                self.result = self.result.wrapping_add(self.working);
                self.working = 0;
                self.index = 0;
            }
        }
    }

    /// Fold in a pending partial word and return the result. The state is reset afterwards.
    pub fn finalize(&mut self) -> u32 {
        if self.index > 0 {
            let shift = 8 * (4 - self.index as u32);
            self.result = self.result.wrapping_add(self.working << shift);
        }
        let result = self.result;
        self.start();
        result
    }
}

/// Streaming checksum selected by a [ChecksumType].
#[derive(Clone)]
pub enum FileChecksum {
    Modular(ModularChecksum),
    Crc32(Digest<'static, u32>),
    Crc32C(Digest<'static, u32>),
    Null,
}

impl Debug for FileChecksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Modular(modular) => f.debug_tuple("Modular").field(modular).finish(),
            Self::Crc32(_) => f.write_str("Crc32"),
            Self::Crc32C(_) => f.write_str("Crc32C"),
            Self::Null => f.write_str("Null"),
        }
    }
}

impl Default for FileChecksum {
    fn default() -> Self {
        Self::Modular(ModularChecksum::new())
    }
}

impl FileChecksum {
    /// Returns [None] for checksum types which are not supported.
    pub fn new(checksum_type: ChecksumType) -> Option<Self> {
        match checksum_type {
            ChecksumType::Modular => Some(Self::Modular(ModularChecksum::new())),
            ChecksumType::Crc32 => Some(Self::Crc32(CRC_32.digest())),
            ChecksumType::Crc32C => Some(Self::Crc32C(CRC_32C.digest())),
            ChecksumType::NullChecksum => Some(Self::Null),
            _ => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Modular(modular) => modular.digest(data),
            Self::Crc32(digest) | Self::Crc32C(digest) => digest.update(data),
            Self::Null => (),
        }
    }

    pub fn finalize(self) -> u32 {
        match self {
            Self::Modular(mut modular) => modular.finalize(),
            Self::Crc32(digest) | Self::Crc32C(digest) => digest.finalize(),
            Self::Null => 0,
        }
    }
}

/// Convenience function to calculate the modular checksum of a complete buffer.
pub fn modular_checksum(data: &[u8]) -> u32 {
    let mut checksum = ModularChecksum::new();
    checksum.digest(data);
    checksum.finalize()
}

//! Environment fingerprint.
//!
//! A segment file stores offsets relative to its base address and fields
//! whose width depends on the platform. Reattaching such a file from a
//! process built differently is unsafe, so a compact fingerprint of the
//! creating environment is written into the header at create time and
//! compared byte-for-byte on every subsequent open.

use crate::error::{StorageError, StorageResult};

/// Size of an encoded fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Version of the on-disk segment layout. Bumped whenever the header or
/// cell layout changes incompatibly.
pub const LAYOUT_VERSION: u16 = 1;

const FP_MAGIC: [u8; 4] = *b"MSFP";
const BUILD_TAG_LEN: usize = 22;

/// Compact record of the environment that created a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    /// 1 = little endian, 2 = big endian.
    endianness: u8,
    /// Width of a pointer in bytes.
    pointer_width: u8,
    /// Width of `usize` in bytes.
    usize_width: u8,
    /// On-disk layout version.
    layout_version: u16,
    /// Package version of the creating build, truncated.
    build_tag: [u8; BUILD_TAG_LEN],
}

impl Fingerprint {
    /// Returns the fingerprint of the current process.
    #[must_use]
    pub fn current() -> Self {
        let mut build_tag = [0u8; BUILD_TAG_LEN];
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        let n = version.len().min(BUILD_TAG_LEN);
        build_tag[..n].copy_from_slice(&version[..n]);

        Self {
            endianness: if cfg!(target_endian = "little") { 1 } else { 2 },
            pointer_width: std::mem::size_of::<*const u8>() as u8,
            usize_width: std::mem::size_of::<usize>() as u8,
            layout_version: LAYOUT_VERSION,
            build_tag,
        }
    }

    /// Encodes the fingerprint into its fixed on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; FINGERPRINT_LEN] {
        let mut buf = [0u8; FINGERPRINT_LEN];
        buf[0..4].copy_from_slice(&FP_MAGIC);
        buf[4] = self.endianness;
        buf[5] = self.pointer_width;
        buf[6] = self.usize_width;
        // buf[7] reserved
        buf[8..10].copy_from_slice(&self.layout_version.to_le_bytes());
        buf[10..10 + BUILD_TAG_LEN].copy_from_slice(&self.build_tag);
        buf
    }

    /// Decodes a fingerprint from its on-disk form.
    pub fn decode(buf: &[u8; FINGERPRINT_LEN]) -> StorageResult<Self> {
        if buf[0..4] != FP_MAGIC {
            return Err(StorageError::IncompatibleBuild);
        }
        let mut build_tag = [0u8; BUILD_TAG_LEN];
        build_tag.copy_from_slice(&buf[10..10 + BUILD_TAG_LEN]);
        Ok(Self {
            endianness: buf[4],
            pointer_width: buf[5],
            usize_width: buf[6],
            layout_version: u16::from_le_bytes([buf[8], buf[9]]),
            build_tag,
        })
    }

    /// Verifies that a stored fingerprint matches the current environment.
    ///
    /// The comparison is byte-for-byte: any difference in endianness,
    /// pointer width, layout version or build tag fails with
    /// [`StorageError::IncompatibleBuild`].
    pub fn verify(stored: &[u8; FINGERPRINT_LEN]) -> StorageResult<()> {
        if *stored == Self::current().encode() {
            Ok(())
        } else {
            Err(StorageError::IncompatibleBuild)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let fp = Fingerprint::current();
        let encoded = fp.encode();
        let decoded = Fingerprint::decode(&encoded).unwrap();
        assert_eq!(fp, decoded);
    }

    #[test]
    fn current_verifies_against_itself() {
        let encoded = Fingerprint::current().encode();
        Fingerprint::verify(&encoded).unwrap();
    }

    #[test]
    fn tampered_fingerprint_is_rejected() {
        let mut encoded = Fingerprint::current().encode();
        encoded[4] ^= 0x03; // flip endianness byte
        assert!(matches!(
            Fingerprint::verify(&encoded),
            Err(StorageError::IncompatibleBuild)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut encoded = Fingerprint::current().encode();
        encoded[0] = b'X';
        assert!(Fingerprint::decode(&encoded).is_err());
    }
}

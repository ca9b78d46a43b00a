//! UF2 image scanning and per-device stamping
//!
//! Firmware built for the batch flasher embeds one or more `HLT #0xAAAA`
//! instructions as placeholders. Before each upload the placeholders are
//! overwritten with the index of the USB port being flashed, so every target
//! learns its own slot number.
//!
//! UF2 images are a sequence of 512-byte blocks: a 32-byte header, a 476-byte
//! payload and a 4-byte trailing magic. Only payload bytes are scanned.

use std::fmt;

use crate::error::ImageError;

/// Size of one UF2 block
pub const CHUNK_SIZE: usize = 512;
/// Bytes of block header preceding the payload
pub const HEADER_SIZE: usize = 32;
/// Bytes of block footer following the payload
pub const FOOTER_SIZE: usize = 4;
/// Payload bytes per block
pub const PAYLOAD_SIZE: usize = CHUNK_SIZE - HEADER_SIZE - FOOTER_SIZE;

/// AArch64 `HLT` opcode (bits 31..21)
pub const HALT_OPCODE: u32 = 0b110_1010_0010;
/// 16-bit immediate used as sentinel, unlikely in real code
pub const SENTINEL_IMMEDIATE: u32 = 0b1010_1010_1010_1010;
/// The 32-bit placeholder word, stored little-endian in the image
pub const PLACEHOLDER_WORD: u32 = (HALT_OPCODE << 21) | (SENTINEL_IMMEDIATE << 5);

const UF2_MAGIC_START0: u32 = 0x0A32_4655;
const UF2_MAGIC_START1: u32 = 0x9E5D_5157;
const UF2_MAGIC_END: u32 = 0x0AB1_6F30;

/// Byte offset of a placeholder word inside an image payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchOffset(usize);

impl PatchOffset {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for PatchOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<usize> for PatchOffset {
    fn eq(&self, other: &usize) -> bool {
        self.0 == *other
    }
}

/// Locate every placeholder word in the payload regions of `image`
///
/// Offsets come back in ascending order. Images shorter than one block, and
/// any trailing partial block, contribute nothing.
pub fn locate(image: &[u8]) -> Vec<PatchOffset> {
    let pattern = PLACEHOLDER_WORD.to_le_bytes();

    image
        .chunks_exact(CHUNK_SIZE)
        .enumerate()
        .flat_map(|(block, chunk)| {
            chunk[HEADER_SIZE..CHUNK_SIZE - FOOTER_SIZE]
                .chunks_exact(4)
                .enumerate()
                .filter(move |(_, word)| *word == pattern)
                .map(move |(stride, _)| PatchOffset(block * CHUNK_SIZE + HEADER_SIZE + stride * 4))
        })
        .collect()
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

/// A firmware image together with its patch locations
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: String,
    bytes: Vec<u8>,
    offsets: Vec<PatchOffset>,
}

impl FirmwareImage {
    /// Wrap image bytes and scan them once for placeholders
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        let offsets = locate(&bytes);
        Ok(Self {
            name: name.into(),
            bytes,
            offsets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Placeholder offsets found when the image was loaded
    pub fn patch_offsets(&self) -> &[PatchOffset] {
        &self.offsets
    }

    /// Number of complete 512-byte blocks
    pub fn block_count(&self) -> usize {
        self.bytes.len() / CHUNK_SIZE
    }

    /// Whether every block carries the UF2 start and end magics
    pub fn is_uf2(&self) -> bool {
        self.bytes.len() % CHUNK_SIZE == 0
            && self.block_count() > 0
            && self.bytes.chunks_exact(CHUNK_SIZE).all(|block| {
                read_u32_le(block, 0) == Some(UF2_MAGIC_START0)
                    && read_u32_le(block, 4) == Some(UF2_MAGIC_START1)
                    && read_u32_le(block, CHUNK_SIZE - FOOTER_SIZE) == Some(UF2_MAGIC_END)
            })
    }

    /// Write `device` as a little-endian 32-bit word at every placeholder
    ///
    /// Stamping is repeatable: the offsets were recorded up front, so a later
    /// call simply overwrites the previous device index.
    pub fn stamp(&mut self, device: u8) {
        let word = u32::from(device).to_le_bytes();
        for offset in &self.offsets {
            let at = offset.get();
            self.bytes[at..at + 4].copy_from_slice(&word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn with_placeholders(len: usize, offsets: &[usize]) -> Vec<u8> {
        let mut image = vec![0u8; len];
        for &at in offsets {
            image[at..at + 4].copy_from_slice(&PLACEHOLDER_WORD.to_le_bytes());
        }
        image
    }

    fn uf2_blocks(count: usize) -> Vec<u8> {
        let mut image = vec![0u8; count * CHUNK_SIZE];
        for block in image.chunks_exact_mut(CHUNK_SIZE) {
            block[0..4].copy_from_slice(&UF2_MAGIC_START0.to_le_bytes());
            block[4..8].copy_from_slice(&UF2_MAGIC_START1.to_le_bytes());
            block[508..512].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
        }
        image
    }

    #[test]
    fn test_placeholder_word() {
        assert_eq!(PLACEHOLDER_WORD, 0xD455_5540);
        assert_eq!(PLACEHOLDER_WORD.to_le_bytes(), [0x40, 0x55, 0x55, 0xD4]);
        assert_eq!(PAYLOAD_SIZE, 476);
    }

    #[test]
    fn test_locate_single_placeholder() {
        let image = with_placeholders(1024, &[40]);
        assert_eq!(locate(&image), vec![PatchOffset(40)]);
    }

    #[test]
    fn test_locate_is_idempotent() {
        let image = with_placeholders(2048, &[40, 600, 1500]);
        let first = locate(&image);
        assert_eq!(first, locate(&image));
        assert_eq!(first, vec![PatchOffset(40), PatchOffset(600), PatchOffset(1500)]);
    }

    #[test]
    fn test_header_and_footer_are_skipped() {
        // Offset 0 is header, 508 is footer, 512 + 4 is the next header
        let image = with_placeholders(1024, &[0, 508, 516]);
        assert!(locate(&image).is_empty());
    }

    #[test]
    fn test_unaligned_placeholder_is_ignored() {
        let image = with_placeholders(512, &[42]);
        assert!(locate(&image).is_empty());
    }

    #[test]
    fn test_short_and_partial_blocks() {
        let short = with_placeholders(256, &[40]);
        assert!(locate(&short).is_empty());

        // The trailing partial block is not scanned
        let partial = with_placeholders(512 + 256, &[40, 512 + 40]);
        assert_eq!(locate(&partial), vec![PatchOffset(40)]);
    }

    #[test]
    fn test_last_payload_word() {
        let image = with_placeholders(512, &[504]);
        assert_eq!(locate(&image), vec![PatchOffset(504)]);
    }

    #[test]
    fn test_stamp_device_index() {
        let mut image = FirmwareImage::new("app.uf2", with_placeholders(1024, &[40])).unwrap();
        assert_eq!(image.patch_offsets(), &[PatchOffset(40)]);

        image.stamp(3);
        assert_eq!(&image.as_bytes()[40..44], &[0x03, 0x00, 0x00, 0x00]);

        // Restamping reuses the recorded offsets
        image.stamp(4);
        assert_eq!(&image.as_bytes()[40..44], &[0x04, 0x00, 0x00, 0x00]);
        assert!(locate(image.as_bytes()).is_empty());
    }

    #[test]
    fn test_stamp_without_placeholders_is_noop() {
        let bytes = uf2_blocks(2);
        let mut image = FirmwareImage::new("plain.uf2", bytes.clone()).unwrap();
        image.stamp(7);
        assert_eq!(image.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn test_empty_image_rejected() {
        assert_eq!(
            FirmwareImage::new("empty.uf2", Vec::new()).unwrap_err(),
            ImageError::Empty
        );
    }

    #[test]
    fn test_uf2_detection() {
        let image = FirmwareImage::new("a.uf2", uf2_blocks(3)).unwrap();
        assert!(image.is_uf2());
        assert_eq!(image.block_count(), 3);

        let raw = FirmwareImage::new("a.bin", vec![0xff; 1024]).unwrap();
        assert!(!raw.is_uf2());
    }
}

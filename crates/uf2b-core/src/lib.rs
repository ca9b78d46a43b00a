//! uf2b-core - Core types for the UF2 batch flasher
//!
//! The controller board exposes one status byte per USB port. This crate gives
//! those bytes a typed shape ([`StatusCode`], [`StatusSnapshot`]), describes the
//! conditions a flash run waits on ([`WaitCondition`]), and locates the
//! placeholder words in a UF2 image that get stamped with a device index
//! before upload ([`FirmwareImage`]).

pub mod error;
pub mod image;
pub mod models;

pub use error::{ImageError, SnapshotError};
pub use image::{locate, FirmwareImage, PatchOffset, PLACEHOLDER_WORD};
pub use models::*;

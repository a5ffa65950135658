//! Core library for the aw-man image viewer.
//!
//! Everything except the rendering surface lives here: archive handling, the
//! page pipeline, the manager coordinating both, and the IPC boundary.

#![deny(missing_debug_implementations)]

pub mod archive;
pub mod codec;
pub mod config;
pub mod events;
pub mod fs;
pub mod log;
pub mod manager;
pub mod pipeline;
pub mod socket;
pub mod types;
pub mod upscale;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

pub use types::{
    ArchiveKind, Command, Executable, ImageDimensions, JumpTarget, Modes, State, UserCommand,
};

/// Returns the version of the core crate for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_semver_version() {
        assert!(version().contains('.'));
    }
}

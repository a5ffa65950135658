//! File system helpers: entry filtering, natural ordering, neighbor lookup.

pub mod natsort;
pub mod neighbors;
mod util;

pub use natsort::{NaturalSorter, natural_cmp};
pub use util::{
    ARCHIVE_EXTENSIONS, IMAGE_EXTENSIONS, detect_kind, is_archive_file, is_supported_image,
};

/// Shared result type for fs operations.
pub type Result<T> = crate::Result<T>;

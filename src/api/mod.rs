//! Purpose: Define the stable public Rust API boundary for starjoin.
//! Exports: Reader, sorter, and join types plus the archive descriptor layer.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: End of a row sequence is `Ok(None)`, never an error.
//! Invariants: Readers own their file handles and release them on close or exhaustion.

mod archive;

pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{TabularFormat, quoted_line};
pub use crate::core::mapped::{MappedReader, MappedRow};
pub use crate::core::reader::RowReader;
pub use crate::core::sort::{
    SORTED_SUFFIX, SortOptions, is_sorted, normalize_and_sort, sorted_path,
};
pub use crate::core::star::{
    JoinOptions, Keyed, ReplacementPolicy, StarJoin, StarRecord, Supersede,
};
pub use crate::core::tokenizer::{TabularRow, Tokenizer};
pub use archive::{Archive, ArchiveFile, FileReader, StarIterator};

//! Purpose: Stream-join a core tabular file with its extension files.
//! Exports: `api` (stable surface) and `core` (tokenizer, mapper, sorter, star join, errors).
//! Role: Library crate; callers supply file descriptors and pull star records lazily.
//! Invariants: Every stage is pull-based and single-threaded from the caller's view.
//! Invariants: Memory use is bounded per row, except for configured sort runs.
pub mod api;
pub mod core;

// Core modules implementing tokenizing, column mapping, external sorting, and the star join.
pub mod error;
pub mod format;
pub mod mapped;
pub mod reader;
pub mod sort;
pub mod star;
pub mod tokenizer;

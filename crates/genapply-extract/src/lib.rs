//! Pure text analysis over generated output: recovering file blocks from
//! free-form model text and inferring the external packages those files
//! import. Nothing in this crate performs I/O.

mod blocks;
mod packages;

pub use blocks::{
    BlockGrammar, BlockMatch, Extraction, FencedGrammar, FileBlockParser, TaggedGrammar, merge_blocks,
};
pub use packages::PackageInferer;

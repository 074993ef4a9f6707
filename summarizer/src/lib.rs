mod digests;
mod errors;

pub mod config;
pub mod fixtures;
pub mod gc;
pub mod metadata;
pub mod path;
pub mod snapshot;
pub mod summarizer_node;
pub mod summary;

pub use digests::{B3Digest, B3_LEN};
pub use errors::Error;

#[cfg(test)]
mod tests;

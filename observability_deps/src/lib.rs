//! Reexports the `tracing` crate so that all other crates in this workspace
//! pull the same version without having to name it directly in their own
//! `Cargo.toml`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

pub use tracing;

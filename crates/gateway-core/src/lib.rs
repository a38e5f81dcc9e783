//! Catalog primitives shared by the tool gateway.
//!
//! Everything in this crate is synchronous and free of I/O: a parsed
//! [`CatalogDocument`] goes in, an immutable [`CatalogSnapshot`] comes out.
//! Loading files, hot-reload and locking live in the gateway crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;

pub use catalog::{
    CatalogDocument, CatalogError, CatalogSnapshot, DEFAULT_ENVIRONMENT, ReverseIndexCollision,
    ToolBinding, ToolDefinition, ToolPermission, ToolSpec,
};

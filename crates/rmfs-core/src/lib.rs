//! rmfs-core: the reMarkable tablet's document store as a filesystem model.
//!
//! This crate provides the core functionality for:
//! - Reading the device's flat metadata records and building a folder tree
//! - Mapping filesystem operations onto that tree and the device
//! - Decoding handwritten notebook pages and rendering them to PDF
//! - The RemoteSession trait abstraction over the device connection

pub mod config;
pub mod convert;
pub mod handles;
pub mod lines;
pub mod mount;
pub mod record;
pub mod remote;
pub mod render;
pub mod tree;

pub use config::MountConfig;
pub use mount::{Attr, DirEntry, ErrorKind, FlushReport, Mount, MountError, OpenedFile};
pub use record::{DocumentKind, DocumentRecord, Parent};
pub use remote::{CommandOutput, InMemorySession, RemoteEntry, RemoteError, RemoteSession};
pub use tree::{DocumentTree, NodeId, RemovePolicy, TreeError};

//! # ooddb Testkit
//!
//! Test utilities for ooddb.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - Property-based test generators using proptest
//! - An in-process mesh of synchronized databases
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ooddb_testkit::prelude::*;
//!
//! #[test]
//! fn writes_reach_every_peer() {
//!     let mut mesh = Mesh::new(2);
//!     mesh.connect(0, 1);
//!     mesh.settle();
//!     mesh.apply(0, &NoteOp::Insert { id: 1, body: "hi".into() });
//!     mesh.settle();
//!     assert_eq!(mesh.notes(0), mesh.notes(1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mesh;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::mesh::*;
}

pub use fixtures::*;
pub use generators::*;
pub use mesh::*;

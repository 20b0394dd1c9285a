//! revisionfs - a FUSE-mounted versioning overlay filesystem. Every write to
//! a regular file creates a new immutable revision; every delete replaces a
//! node with a tombstone instead of destroying it. Both are reversible
//! through the on-disk version-directory state alone.

pub mod backing;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod path;

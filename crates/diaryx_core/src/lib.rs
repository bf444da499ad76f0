//! Core CRDT synchronization engine for Diaryx workspaces.
//!
//! This crate owns the data that two or more devices must agree on: the
//! workspace file hierarchy and frontmatter ([`crdt::WorkspaceCrdt`]), each
//! file's editable body ([`crdt::BodyDoc`]), and the I/O-free protocol
//! state machine that drives both over an unreliable transport
//! ([`crdt::Session`]). Everything outside that -- the editor, the CLI, the
//! transport's socket lifecycle -- is an external collaborator that talks
//! to this crate through the types in [`crdt`] and [`error`].

pub mod crdt;
pub mod error;

pub use error::{DiaryxError, Result};

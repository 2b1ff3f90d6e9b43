//! Two-phase snapshot codec: manifest format, generator, and applier.

pub mod applier;
pub mod generator;
pub mod manifest;

pub use applier::{apply, ApplySnapshotInput, ApplyProgress};
pub use generator::{generate, GenerateSnapshotInput, GenerateProgress};
pub use manifest::{Manifest, SequenceEntry, TableEntry};

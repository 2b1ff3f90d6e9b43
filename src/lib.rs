//! Core library for steep-core: the init/reinit/merge coordinator for
//! bidirectional PostgreSQL 18 logical replication.
//!
//! This crate implements the state machine, two-phase snapshot codec,
//! parallel table copier, overlap analyzer, conflict resolver, FK ordering,
//! progress model, audit log, and control-plane surface described in
//! `SPEC_FULL.md`. The PostgreSQL extension, daemon scaffolding, CLI
//! front-end, and logical replication apply itself are external
//! collaborators; this crate calls the extension's SQL functions by name and
//! trusts their contracts.

pub mod audit;
pub mod config;
pub mod conflict;
pub mod copier;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod fk;
pub mod init_manager;
pub mod logical_replication;
pub mod operation;
pub mod overlap;
pub mod progress;
pub mod rpc;
pub mod snapshot;
pub mod state_machine;
pub mod table;
pub mod version;

pub use config::CoordinatorConfig;
pub use error::{CoordinatorError, CoordinatorResult};
pub use init_manager::InitManager;
pub use operation::{Operation, OperationRegistry};
pub use rpc::Coordinator;
pub use table::{PrimaryKeyInfo, Table};

/// Newtype identifiers, kept distinct from bare `String` so call sites can't
/// confuse a node id with a snapshot id with an operation id.
mod ids {
    use std::fmt;

    macro_rules! string_newtype {
        ($name:ident) => {
            #[derive(
                Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
            )]
            pub struct $name(pub String);

            impl $name {
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<String> for $name {
                fn from(s: String) -> Self {
                    Self(s)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> Self {
                    Self(s.to_string())
                }
            }
        };
    }

    string_newtype!(NodeId);
    string_newtype!(SnapshotId);
    string_newtype!(OperationId);
}

pub use ids::{NodeId, OperationId, SnapshotId};

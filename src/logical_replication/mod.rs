pub mod message;
pub mod publication;
pub mod slot;
pub mod subscription;

pub use message::{Lsn, PrimaryKeepAlive, ReplicationMessage, XLogData};
pub use publication::Publication;
pub use slot::Slot;
pub use subscription::Subscription;

pub mod block;
pub mod collaborators;
pub mod config;
pub mod copy;
pub mod error;
pub mod events;
pub mod logger;
pub mod nbd;
pub mod phase;
pub mod preflight;
pub mod process;
pub mod reconcile;
pub mod resolver;
pub mod session_cache;
pub mod sync;
pub mod target;
pub mod transport;

pub use error::MigrationError;

pub type Result<T> = std::result::Result<T, MigrationError>;

// Convenience re-exports for the migration core
pub use block::{Block, BlockFlags, BlockSource, ChangeSet, Extent};
pub use config::MigrateConfig;
pub use copy::{BulkCopier, CopyEngine, CopyProgress, CopyStats};
pub use phase::MigrationPhase;
pub use reconcile::{Collaborators, MigrationRecord, ReconcileOutcome, Reconciler};
pub use resolver::BlockStatusResolver;
pub use transport::{Credentials, DiskRef, TransportManager, TransportSession};

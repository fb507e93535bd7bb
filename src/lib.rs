//! Durable recovery log for an XA transaction manager.
//!
//! A transaction manager records the state of every in-flight
//! transaction (a recovery unit) in a [`RecoveryLog`] and forces it to
//! disk at each point where a crash would otherwise lose a decision.
//! After a crash, this server or a peer that has taken over the dead
//! server's failure scope opens the log again and gets back every unit
//! that was not yet forgotten.
//!
//! The pieces, bottom up:
//!
//! - [`codec`] turns a [`RecoveryRecord`] into checksummed bytes.
//! - [`section::LogSection`] is the in-memory view of one section.
//! - [`store`] holds the durable side: [`store::RecoveryLogStore`]
//!   for records and [`store::LeaseStore`] for ownership, with a
//!   SQLite and an in-memory implementation.
//! - [`lease`] decides which server may write to a failure scope.
//! - [`coordinator`] ties them together behind [`RecoveryLog`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use recovery_log::store::sqlite::SqliteStore;
//! use recovery_log::*;
//!
//! # fn main() -> recovery_log::errors::Result<()> {
//! let config = RecoveryLogConfig::from_file("recovery_log.json".as_ref())?;
//! let store = Arc::new(SqliteStore::open("tx.sqlite3".as_ref(), &config.store)?);
//! let log = RecoveryLog::with_store(store, config);
//!
//! let replayed = log.open(&FailureScope::new("server1"))?;
//! for _unit in replayed.units {
//!     // Resolve in-doubt transactions.
//! }
//! log.write_record(SectionId(1), RecoveryUnitId(42), b"prepared".to_vec())?;
//! log.force_flush()?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod lease;
pub mod model;
pub mod section;
pub mod store;
pub mod tracing;

pub use crate::config::RecoveryLogConfig;
pub use crate::coordinator::LogState;
pub use crate::coordinator::RecoveryLog;
pub use crate::coordinator::ReplayedState;
pub use crate::errors::RecoveryLogError;
pub use crate::model::*;

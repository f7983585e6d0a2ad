//! Persistence layer: libSQL-backed storage for accounts, scheduled messages,
//! the failure log and the reply inbox.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Account, AccountStats, Database, FailureRecord, MessageState, NewAccount, NewReply,
    NewScheduledMessage, RecoveryReport, ReplyRecord, ScheduledMessage, StateFields,
};

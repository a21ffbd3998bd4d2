//! Port 実装
//!
//! - **InMemoryTaskStore**: テスト・デモ・単一 coordinator 構成向けのプロセス内ストア
//! - **SqliteTaskStore**: 同一ホストのエージェントで共有する永続ストア
//! - **TracingAbortNotifier** / **BroadcastAbortNotifier**: abort 通知

mod batch;

pub mod abort;
pub mod inmem_store;
pub mod sqlite_store;

pub use self::abort::{BroadcastAbortNotifier, TracingAbortNotifier};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;

//! heddle-core
//!
//! 複数エージェントで共有する pipeline run の調整層。
//! タスクは期限付き lease の下で claim され、ready 判定は依存グラフに従い、
//! キャンセルは依存先へ cascade する。
//!
//! # モジュール構成
//! - **domain**: ID、task/run レコード、状態、preset、cancel policy、エラー
//! - **ports**: TaskStore, Clock, IdGenerator, AbortNotifier
//! - **impls**: InMemory / SQLite ストア、abort 通知
//! - **app**: claim 管理、依存グラフ、lease 監視、キャンセル、Coordinator API
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Coordinator, CoordinatorBuilder, FailOutcome};
pub use config::HeddleConfig;
pub use domain::{HeddleError, Result};

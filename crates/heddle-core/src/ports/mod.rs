//! Ports（ヘキサゴナルアーキテクチャ）
//!
//! 各 trait は調整ロジックの外側との境界：
//! - 正本を持つストア
//! - 時計と ID 採番
//! - エージェントへの通知経路

pub mod abort_notifier;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::abort_notifier::{AbortNotice, AbortNotifier};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{ReadyFilter, TaskStore};

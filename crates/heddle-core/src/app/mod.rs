//! App 層 - ports を組み合わせたコンポーネント群
//!
//! - **DependencyGraph**: preset 展開、ready 伝播
//! - **ClaimManager**: claim / renew / start / complete / fail
//! - **LeaseMonitor**: 期限切れ lease のバックグラウンド回収
//! - **CancellationCoordinator**: スコープ指定の cascade と失敗 cascade
//! - **RunStatusTracker**: run の roll-up とステータスレポート
//! - **Coordinator** / **CoordinatorBuilder**: 公開 API と配線
//! - **AgentGroup**: エージェントループの参照実装

pub mod agent_loop;
pub mod builder;
pub mod cancel;
pub mod claim;
pub mod coordinator;
pub mod graph;
pub mod lease_monitor;
pub mod status;

pub use self::agent_loop::{AgentGroup, AgentOptions, TaskExecutor};
pub use self::builder::CoordinatorBuilder;
pub use self::cancel::{CancelReport, CancellationCoordinator};
pub use self::claim::{ClaimManager, FailOutcome};
pub use self::coordinator::Coordinator;
pub use self::graph::DependencyGraph;
pub use self::lease_monitor::{LeaseMonitor, LeaseMonitorHandle, SweepReport};
pub use self::status::RunStatusTracker;

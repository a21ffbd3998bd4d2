//! ドメインモデル（ID、レコード、状態、preset、エラー）

pub mod cancel;
pub mod dependency;
pub mod errors;
pub mod ids;
pub mod preset;
pub mod run;
pub mod state;
pub mod task;

pub use cancel::{CancelMode, CancelPolicy, CancelScope, CancelTarget, CascadeCause};
pub use dependency::DependencyIndex;
pub use errors::{ErrorKind, HeddleError, Result};
pub use ids::{AgentId, RunId, TaskId};
pub use preset::{Preset, PresetParams, ResolvedStage, StageShape};
pub use run::{PipelineRun, RunStatusReport, StatusCounts, TaskFailure};
pub use state::{RunStatus, TaskStatus};
pub use task::{Task, TaskGuard, TaskSpec, TaskUpdate};

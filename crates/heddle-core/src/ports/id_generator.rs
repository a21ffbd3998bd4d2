//! IdGenerator port
//!
//! ID はストアではなく coordinator 側で採番する。
//! 書き込み前に、同じバッチ内の task spec 同士が互いを参照できるようにするため。

use crate::domain::{RunId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_run_id(&self) -> RunId;

    fn generate_task_id(&self) -> TaskId;
}

/// Clock の時刻を刻んだ ULID
///
/// `FixedClock` ならタイムスタンプ部は決定的。一意性はランダム部で保つ。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_run_id(&self) -> RunId {
        RunId::from(self.next_ulid())
    }

    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }
}

/*!
 * 运行控制器
 *
 * 工作区级的原子标志对：模式（all / manual）与暂停位。
 * 变更通过 watch 通道发布给订阅者。
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 运行模式
///
/// all：排队任务自动提升执行；manual：等待外部逐个批准。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    All,
    Manual,
}

/// 控制器状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    pub mode: RunMode,
    pub paused: bool,
}

pub struct RunController {
    state: Mutex<RunState>,
    tx: watch::Sender<RunState>,
}

impl RunController {
    pub fn new(mode: RunMode) -> Self {
        let state = RunState {
            mode,
            paused: false,
        };
        let (tx, _) = watch::channel(state);
        Self {
            state: Mutex::new(state),
            tx,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.state.lock().mode
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn set_mode(&self, mode: RunMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        let _ = self.tx.send(*state);
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        let _ = self.tx.send(*state);
    }

    /// 订阅状态变更
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new(RunMode::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mode_and_pause_flags() {
        let controller = RunController::new(RunMode::All);
        assert_eq!(controller.mode(), RunMode::All);
        assert!(!controller.is_paused());

        controller.set_mode(RunMode::Manual);
        controller.set_paused(true);
        assert_eq!(controller.mode(), RunMode::Manual);
        assert!(controller.is_paused());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let controller = RunController::new(RunMode::All);
        let mut rx = controller.subscribe();
        controller.set_mode(RunMode::Manual);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().mode, RunMode::Manual);
    }
}

//! 适配器状态监视
//!
//! 被动观察本地无线电的电源/授权状态，不做任何控制。
//! 状态变化由平台驱动推送，调用方可以订阅 `watch` 通道，也可以把
//! "就绪后再做" 的意图挂到监视器上，等进入 `PoweredOn` 时重放一次。

use std::fmt;
use tokio::sync::watch;

use crate::error::BleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "poweredOff",
            AdapterState::PoweredOn => "poweredOn",
        }
    }

    /// `Unsupported` / `Unauthorized` 在本次会话内不会恢复
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdapterState::Unsupported | AdapterState::Unauthorized)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 挂起意图的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// 已排队，等待 `PoweredOn`
    Queued,
    /// 相同意图已在队列中
    AlreadyQueued,
}

pub struct AdapterMonitor<I> {
    tx: watch::Sender<AdapterState>,
    pending: Vec<I>,
}

impl<I: PartialEq> AdapterMonitor<I> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AdapterState::Unknown);
        Self {
            tx,
            pending: Vec::new(),
        }
    }

    pub fn current_state(&self) -> AdapterState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.tx.subscribe()
    }

    pub fn is_powered_on(&self) -> bool {
        self.current_state() == AdapterState::PoweredOn
    }

    pub fn ensure_powered(&self) -> Result<(), BleError> {
        match self.current_state() {
            AdapterState::PoweredOn => Ok(()),
            other => Err(BleError::AdapterUnavailable(other)),
        }
    }

    /// 挂起一个意图，适配器进入 `PoweredOn` 时交还给调用方执行
    pub fn defer(&mut self, intent: I) -> Result<Deferral, BleError> {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(BleError::AdapterUnavailable(state));
        }
        if self.pending.contains(&intent) {
            return Ok(Deferral::AlreadyQueued);
        }
        self.pending.push(intent);
        Ok(Deferral::Queued)
    }

    pub fn pending(&self) -> &[I] {
        &self.pending
    }

    /// 记录新的状态，返回需要重放的意图
    ///
    /// 只有从非 `PoweredOn` 进入 `PoweredOn` 时才会返回意图，且每个意图只返回一次。
    /// 进入终止状态时丢弃所有挂起意图。
    pub fn update(&mut self, state: AdapterState) -> Vec<I> {
        let previous = self.tx.send_replace(state);
        if state.is_terminal() {
            self.pending.clear();
            return Vec::new();
        }
        if state == AdapterState::PoweredOn && previous != AdapterState::PoweredOn {
            return std::mem::take(&mut self.pending);
        }
        Vec::new()
    }
}

impl<I: PartialEq> Default for AdapterMonitor<I> {
    fn default() -> Self {
        Self::new()
    }
}

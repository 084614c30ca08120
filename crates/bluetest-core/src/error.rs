//! 错误分类
//!
//! 所有异步结果都通过事件流返回，这里的错误只用于同步拒绝请求，
//! 以及在 outcome 中携带失败原因。

use crate::adapter::AdapterState;
use crate::gatt::CharacteristicRole;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable (state: {0})")]
    AdapterUnavailable(AdapterState),

    #[error("`{operation}` is not valid while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("No bound characteristic for role `{0}`")]
    CharacteristicUnavailable(CharacteristicRole),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Engine event loop has stopped")]
    EngineStopped,
}

impl BleError {
    pub(crate) fn invalid_state(operation: &'static str, phase: &'static str) -> Self {
        BleError::InvalidState { operation, phase }
    }
}

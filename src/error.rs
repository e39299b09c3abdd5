use thiserror::Error;

use crate::lock::LockState;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("ロック取得がキャンセルされました: {0}")]
    Cancelled(String),
    #[error("ストアに到達できません（連続 {attempts} 回失敗）: {message}")]
    StoreUnavailable { attempts: u32, message: String },
    #[error("ロックは既に失われています: {0}")]
    AlreadyLost(String),
    #[error("{operation} は {state:?} 状態では実行できません")]
    InvalidState {
        operation: &'static str,
        state: LockState,
    },
    #[error("ストアエラー: {0}")]
    Store(String),
}

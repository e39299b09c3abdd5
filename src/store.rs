use std::time::Duration;

use async_trait::async_trait;

use crate::LockError;

/// LockStore はロック状態を保持する KV ストアへのインターフェース。
///
/// 3 つの変更系操作はストア側でアトミックに実行されること。
/// 条件付き操作（delete / extend）は保存値が expected と一致する
/// 場合のみ作用し、一致しなければ何もせず false を返す。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// キーが存在しない場合のみ value を TTL 付きで設定する。
    /// この呼び出しがキーを作成したときだけ true。
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// 保存値が expected と一致する場合のみキーを削除する。
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, LockError>;

    /// 保存値が expected と一致する場合のみ TTL を ttl にリセットする。
    async fn extend_if_value(&self, key: &str, expected: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// キーが存在する（= 誰かがロックを保持している）かを返す。
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
}

use std::time::Duration;

/// LockConfig はロックハンドルの動作パラメータ。
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// ブロッキング取得のスピンリトライ間隔
    pub poll_interval: Duration,
    /// ブロッキング取得中に許容するストア連続失敗回数
    pub max_store_failures: u32,
    /// 解放時に更新タスクの停止を待つ猶予時間（超過で強制終了）
    pub stop_grace: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_store_failures: 3,
            stop_grace: Duration::from_secs(1),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::store::LockStore;
use crate::LockError;

/// LockState はロックハンドルのライフサイクル状態。
/// `Lost` と `Released` は終端状態で、遷移後のハンドルは再利用できない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Held,
    Lost,
    Released,
}

struct Shared {
    state: Mutex<LockState>,
    lost: CancellationToken,
}

struct Watchdog {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// DistributedLock はリース型分散ロックのハンドル。
///
/// ハンドル生成時に一意のフェンシングトークン（UUID v4）を払い出し、
/// ストア上のキーの値として記録する。更新・解放はトークンが一致する
/// 場合のみ成立する。保持中はリース期間の 1/3 周期で TTL を再設定する
/// 更新タスクがバックグラウンドで動く。
///
/// ハンドルは単回使用。`Released` / `Lost` に達したハンドルで再取得は
/// できず、呼び出し元は新しいハンドルを作る。取得失敗
/// （キャンセル・ストア障害）では状態は `Unlocked` のまま残り、
/// 再試行できる。
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    lease: Duration,
    config: LockConfig,
    shared: Arc<Shared>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, key: impl Into<String>, lease: Duration) -> Self {
        Self::with_config(store, key, lease, LockConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        lease: Duration,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            lease,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(LockState::Unlocked),
                lost: CancellationToken::new(),
            }),
            watchdog: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// このハンドルのフェンシングトークン。
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn state(&self) -> LockState {
        *self.shared.state.lock().await
    }

    pub async fn is_held(&self) -> bool {
        self.state().await == LockState::Held
    }

    /// ロック喪失（`Held` → `Lost`）で一度だけキャンセルされるトークン。
    /// リース数周期を超える長いクリティカルセクションは、処理継続前に
    /// これを確認すること。
    pub fn lost_signal(&self) -> CancellationToken {
        self.shared.lost.clone()
    }

    /// ロックの取得を一度だけ試みる。
    ///
    /// 競合（キーが既に存在する）は `Ok(false)` であってエラーではない。
    /// ストア障害はエラーとして返す。
    pub async fn try_lock(&self) -> Result<bool, LockError> {
        {
            let state = self.shared.state.lock().await;
            if *state != LockState::Unlocked {
                return Err(LockError::InvalidState {
                    operation: "try_lock",
                    state: *state,
                });
            }
        }
        match self
            .store
            .set_if_absent(&self.key, &self.token, self.lease)
            .await
        {
            Ok(true) => {
                self.transition_to_held().await;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 取得できるまでブロックする。
    ///
    /// 競合中は `poll_interval` 間隔でリトライし続ける。待機は
    /// `cancel` で即座に中断され、`Cancelled` を返す。ストア呼び出しの
    /// 連続失敗が `max_store_failures` に達した場合は競合と区別して
    /// `StoreUnavailable` で打ち切る。
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        let mut failures: u32 = 0;
        loop {
            {
                let state = self.shared.state.lock().await;
                if *state != LockState::Unlocked {
                    return Err(LockError::InvalidState {
                        operation: "lock",
                        state: *state,
                    });
                }
            }
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled(self.key.clone()));
            }
            match self
                .store
                .set_if_absent(&self.key, &self.token, self.lease)
                .await
            {
                Ok(true) => {
                    self.transition_to_held().await;
                    tracing::debug!(key = %self.key, "ロックを取得しました");
                    return Ok(());
                }
                Ok(false) => {
                    // 競合は正常系。失敗カウンタは連続したストア障害のみ数える。
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        key = %self.key,
                        error = %e,
                        attempt = failures,
                        "ロック取得中のストアエラー"
                    );
                    if failures >= self.config.max_store_failures {
                        return Err(LockError::StoreUnavailable {
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled(self.key.clone())),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// タイムアウト付きのブロッキング取得。
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        let cancel = CancellationToken::new();
        let timer_token = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_token.cancel();
        });
        let result = self.lock(&cancel).await;
        timer.abort();
        result
    }

    /// ロックを解放する。`Held` 以外からの呼び出しは `InvalidState`。
    ///
    /// 条件付き削除が不成立だった場合、リースは既に失効して他者に
    /// 取得されている。この場合は `AlreadyLost` を返し、状態は `Lost` に
    /// 遷移する。
    pub async fn unlock(&self) -> Result<(), LockError> {
        {
            let state = self.shared.state.lock().await;
            if *state != LockState::Held {
                return Err(LockError::InvalidState {
                    operation: "unlock",
                    state: *state,
                });
            }
        }
        // 更新タスクを先に止める。解放と更新が競合してはならない。
        self.stop_watchdog().await;

        match self.store.delete_if_value(&self.key, &self.token).await {
            Ok(true) => {
                *self.shared.state.lock().await = LockState::Released;
                tracing::debug!(key = %self.key, "ロックを解放しました");
                Ok(())
            }
            Ok(false) => {
                *self.shared.state.lock().await = LockState::Lost;
                self.shared.lost.cancel();
                Err(LockError::AlreadyLost(self.key.clone()))
            }
            // ストア障害時は Held のまま返す。更新は停止済みのため、
            // 再試行されなくてもリースは自然に失効する。
            Err(e) => Err(e),
        }
    }

    async fn transition_to_held(&self) {
        {
            let mut state = self.shared.state.lock().await;
            *state = LockState::Held;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renewal_loop(
            Arc::clone(&self.store),
            self.key.clone(),
            self.token.clone(),
            self.lease,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *self.watchdog.lock().await = Some(Watchdog { cancel, task });
    }

    async fn stop_watchdog(&self) {
        let watchdog = self.watchdog.lock().await.take();
        if let Some(Watchdog { cancel, mut task }) = watchdog {
            cancel.cancel();
            if tokio::time::timeout(self.config.stop_grace, &mut task)
                .await
                .is_err()
            {
                tracing::warn!(key = %self.key, "更新タスクが猶予時間内に停止しないため強制終了します");
                task.abort();
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        // unlock を経ずに破棄された場合も更新タスクを残さない。
        // キー自体はリース満了でストア側から消える。
        if let Ok(mut watchdog) = self.watchdog.try_lock() {
            if let Some(watchdog) = watchdog.take() {
                watchdog.cancel.cancel();
            }
        }
    }
}

/// 保持中のリースを周期的に再主張する更新タスク本体。
///
/// 周期はリース期間の 1/3。自然失効までに更新が最低 2 回試行される。
/// 条件付き延長が不成立（トークン不一致・キー消失）ならロックは喪失
/// しており、以後の更新は行わず `Lost` へ遷移して終了する。
async fn renewal_loop(
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    lease: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let interval = (lease / 3).max(Duration::from_millis(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                match store.extend_if_value(&key, &token, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // 不成立後の再試行は他者のロックを延長しかねない。
                        {
                            let mut state = shared.state.lock().await;
                            if *state == LockState::Held {
                                *state = LockState::Lost;
                            }
                        }
                        shared.lost.cancel();
                        tracing::warn!(key = %key, "リースの所有権を喪失しました");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "リース更新に失敗、次のティックで再試行します"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLockStore;
    use crate::store::MockLockStore;

    fn fast_config() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(10),
            max_store_failures: 3,
            stop_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_new_handle_starts_unlocked() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = DistributedLock::new(store, "job:1", Duration::from_secs(10));

        assert_eq!(lock.state().await, LockState::Unlocked);
        assert!(!lock.is_held().await);
        assert_eq!(lock.key(), "job:1");
        assert!(!lock.token().is_empty());
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_handle() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let a = DistributedLock::new(store.clone(), "job:1", Duration::from_secs(10));
        let b = DistributedLock::new(store, "job:1", Duration::from_secs(10));
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn test_try_lock_while_held_is_invalid_state() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = DistributedLock::new(store, "job:1", Duration::from_secs(10));

        assert!(lock.try_lock().await.unwrap());
        let result = lock.try_lock().await;
        assert!(matches!(
            result,
            Err(LockError::InvalidState {
                operation: "try_lock",
                state: LockState::Held,
            })
        ));
    }

    #[tokio::test]
    async fn test_handle_is_single_use_after_release() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = DistributedLock::new(store, "job:1", Duration::from_secs(10));

        assert!(lock.try_lock().await.unwrap());
        lock.unlock().await.unwrap();

        assert!(matches!(
            lock.try_lock().await,
            Err(LockError::InvalidState { .. })
        ));
        let cancel = CancellationToken::new();
        assert!(matches!(
            lock.lock(&cancel).await,
            Err(LockError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_store_unavailable_after_consecutive_failures() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(3)
            .returning(|_, _, _| Err(LockError::Store("connection refused".to_string())));

        let lock = DistributedLock::with_config(
            Arc::new(store),
            "job:1",
            Duration::from_secs(10),
            fast_config(),
        );
        let cancel = CancellationToken::new();

        let result = lock.lock(&cancel).await;
        match result {
            Err(LockError::StoreUnavailable { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("connection refused"));
            }
            other => panic!("Expected StoreUnavailable, got {:?}", other),
        }
        assert_eq!(lock.state().await, LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_contention_resets_failure_counter() {
        let mut seq = mockall::Sequence::new();
        let mut store = MockLockStore::new();
        // 失敗2回 → 競合（カウンタ戻る）→ 失敗2回 → 成功
        for _ in 0..2 {
            store
                .expect_set_if_absent()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Err(LockError::Store("io error".to_string())));
        }
        store
            .expect_set_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(false));
        for _ in 0..2 {
            store
                .expect_set_if_absent()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Err(LockError::Store("io error".to_string())));
        }
        store
            .expect_set_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));

        let lock = DistributedLock::with_config(
            Arc::new(store),
            "job:1",
            Duration::from_secs(60),
            fast_config(),
        );
        let cancel = CancellationToken::new();

        lock.lock(&cancel).await.unwrap();
        assert_eq!(lock.state().await, LockState::Held);
    }

    #[tokio::test]
    async fn test_unlock_store_error_keeps_held_and_allows_retry() {
        let mut seq = mockall::Sequence::new();
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));
        store
            .expect_delete_if_value()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(LockError::Store("timeout".to_string())));
        store
            .expect_delete_if_value()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));

        let lock = DistributedLock::with_config(
            Arc::new(store),
            "job:1",
            Duration::from_secs(60),
            fast_config(),
        );
        assert!(lock.try_lock().await.unwrap());

        assert!(matches!(lock.unlock().await, Err(LockError::Store(_))));
        assert_eq!(lock.state().await, LockState::Held);

        lock.unlock().await.unwrap();
        assert_eq!(lock.state().await, LockState::Released);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_unlocked() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let holder = DistributedLock::new(store.clone(), "job:1", Duration::from_secs(10));
        assert!(holder.try_lock().await.unwrap());

        let contender = DistributedLock::with_config(
            store,
            "job:1",
            Duration::from_secs(10),
            fast_config(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = contender.lock(&cancel).await;
        assert!(matches!(result, Err(LockError::Cancelled(_))));
        assert_eq!(contender.state().await, LockState::Unlocked);
    }
}

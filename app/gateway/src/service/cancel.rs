//! 协作式取消信号
//!
//! 基于 `tokio::sync::watch` 的可克隆取消令牌。子令牌持有父链上所有信号，
//! 任一祖先被取消时子令牌即视为已取消，不需要额外的后台任务。

use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

/// 取消令牌
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// 自身信号位于末尾，其余为祖先信号
    chain: Arc<Vec<Arc<watch::Sender<bool>>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            chain: Arc::new(vec![Arc::new(tx)]),
        }
    }

    /// 创建子令牌：取消子令牌不影响父令牌
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut chain: Vec<_> = self.chain.iter().cloned().collect();
        chain.push(Arc::new(tx));
        Self {
            chain: Arc::new(chain),
        }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|tx| *tx.borrow())
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        let waiters = self.chain.iter().map(|tx| {
            let mut rx = tx.subscribe();
            Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waiters).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("等待取消超时")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        // 父令牌取消会传递给子令牌，反之不成立
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), sibling.cancelled())
            .await
            .expect("子令牌未随父令牌取消");
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("已取消的令牌应立即返回");
    }
}

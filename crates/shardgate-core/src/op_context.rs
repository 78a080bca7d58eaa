use crate::error::{Result, ShardgateError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Deadline, cancellation and session of one client operation. Passed
/// explicitly to everything that may suspend on its behalf.
#[derive(Debug, Clone)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    session: Option<Uuid>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            session: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_session(mut self, session: Uuid) -> Self {
        self.session = Some(session);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deadline, or `fallback` from now when the operation has none.
    pub fn deadline_or(&self, fallback: Duration) -> Instant {
        self.deadline.unwrap_or_else(|| Instant::now() + fallback)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Polled at every suspension point.
    pub fn check_for_interrupt(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ShardgateError::Interrupted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ShardgateError::ExceededTimeLimit);
            }
        }
        Ok(())
    }

    /// Run `fut` unless the operation is cancelled or runs out of time first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check_for_interrupt()?;
        let deadline = self.deadline;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ShardgateError::Interrupted),
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => Err(ShardgateError::ExceededTimeLimit),
            res = fut => res,
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_reports_cancel_and_deadline() {
        let ctx = OperationContext::new();
        assert!(ctx.check_for_interrupt().is_ok());
        ctx.cancel();
        assert_eq!(ctx.check_for_interrupt(), Err(ShardgateError::Interrupted));

        let timed = OperationContext::with_timeout(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(timed.check_for_interrupt(), Err(ShardgateError::ExceededTimeLimit));
    }

    #[tokio::test]
    async fn run_abandons_slow_work() {
        let ctx = OperationContext::with_timeout(Duration::from_millis(10));
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(res, Err(ShardgateError::ExceededTimeLimit));

        let ctx = OperationContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let res: Result<()> = ctx.run(std::future::pending()).await;
        assert_eq!(res, Err(ShardgateError::Interrupted));
    }
}

//! Async timeout wrappers and the deadline constants shared across the
//! server.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time;

/// Default per-operation deadline for credential-bearing handlers.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(4);

/// Drain deadline for graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut` under `duration`, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_deadline() {
        let value = with_timeout(async { Ok(7u32) }, Duration::from_millis(50))
            .await
            .expect("in time");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn expiry_maps_to_timeout() {
        let result: Result<()> = with_timeout(
            async {
                time::sleep(Duration::from_millis(100)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }
}

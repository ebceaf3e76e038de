//! Deadlines for calls into the proxy runtime.

use std::future::Future;
use std::time::Duration;

use crate::runtime::{RuntimeError, RuntimeResult};

/// Run a runtime call with a deadline; elapsing maps to `RuntimeError::Timeout`.
pub async fn with_timeout<T, F>(deadline: Duration, call: F) -> RuntimeResult<T>
where
    F: Future<Output = RuntimeResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout(deadline.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_call_times_out() {
        let result: RuntimeResult<()> = with_timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RuntimeError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}

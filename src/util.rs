use std::{fmt::Display, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::warn;

mod html_ext;

pub use html_ext::Element;

#[derive(Default)]
pub struct W<T>(pub T);

// Runs the future until it finishes or the signal fires, whichever comes
// first. Returns `None` when cancelled; the future is dropped at that point.
pub async fn cancellable<F, T>(signal: &CancellationToken, fut: F) -> Option<T>
where
  F: Future<Output = T>,
{
  tokio::select! {
    biased;
    _ = signal.cancelled() => None,
    out = fut => Some(out),
  }
}

// Returns false if the signal fired before the delay elapsed.
pub async fn sleep_cancellable(
  signal: &CancellationToken,
  delay: Duration,
) -> bool {
  cancellable(signal, tokio::time::sleep(delay)).await.is_some()
}

// Calls `attempt` up to `attempts` times, sleeping a fixed `delay` between
// failures. The last error is returned once all attempts are used up.
pub async fn retry_fixed<T, E, F, Fut>(
  attempts: u32,
  delay: Duration,
  what: &str,
  mut attempt: F,
) -> Result<T, E>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Display,
{
  let attempts = attempts.max(1);
  let mut n = 1;
  loop {
    match attempt(n).await {
      Ok(res) => return Ok(res),
      Err(e) if n >= attempts => return Err(e),
      Err(e) => {
        warn!(attempt = n, "retrying {}: {}", what, e);
        tokio::time::sleep(delay).await;
        n += 1;
      }
    }
  }
}

#[cfg(test)]
mod test {
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn test_retry_fixed_stops_after_first_success() {
    let calls = AtomicU32::new(0);
    let res: Result<u32, String> =
      super::retry_fixed(3, Duration::from_millis(10), "test", |n| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 3 {
            Err(format!("failure {n}"))
          } else {
            Ok(n)
          }
        }
      })
      .await;

    assert_eq!(res, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_retry_fixed_returns_last_error() {
    let res: Result<(), String> =
      super::retry_fixed(2, Duration::from_millis(1), "test", |n| async move {
        Err(format!("failure {n}"))
      })
      .await;

    assert_eq!(res, Err("failure 2".to_string()));
  }

  #[tokio::test]
  async fn test_cancellable() {
    let signal = CancellationToken::new();
    assert_eq!(super::cancellable(&signal, async { 1 }).await, Some(1));

    signal.cancel();
    let never = futures::future::pending::<()>();
    assert_eq!(super::cancellable(&signal, never).await, None);
    assert!(!super::sleep_cancellable(&signal, Duration::from_secs(5)).await);
  }
}

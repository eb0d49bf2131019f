use log::warn;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Outcome of one attempt.
pub enum Attempt<T, E> {
    Done(T),
    /// Transient failure; try again if attempts remain.
    Retry(E),
    /// Permanent failure; stop immediately.
    Abort(E),
}

#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{0}")]
    Aborted(#[source] E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
}

/// Run `attempt` up to `max_attempts` times, sleeping `delay` between transient failures.
pub async fn retry<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(err) => return Err(RetryError::Aborted(err)),
            Attempt::Retry(err) if n >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: n,
                    last: err,
                })
            }
            Attempt::Retry(err) => {
                warn!("Attempt {n}/{max_attempts} failed, retrying: {err}");
                tokio::time::sleep(delay).await;
                n += 1;
            }
        }
    }
}

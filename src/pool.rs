//! Bounded fan-out of async jobs over a tokio `JoinSet`.

use std::future::Future;

use anyhow::Context as _;

/// Runs `f` over `jobs` with at most `concurrency` tasks in flight and returns the
/// results in job order. The first failing job aborts the tasks still running;
/// its error is returned once they have been torn down.
pub async fn run_bounded<J, T, F, Fut>(
    concurrency: usize,
    jobs: Vec<J>,
    f: F,
) -> anyhow::Result<Vec<T>>
where
    J: Send + 'static,
    T: Send + 'static,
    F: Fn(J) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let total = jobs.len();
    let concurrency = concurrency.max(1).min(total.max(1));
    let mut pending = jobs.into_iter().enumerate();
    let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut join_set = tokio::task::JoinSet::new();
    let mut done = 0usize;

    loop {
        while join_set.len() < concurrency {
            let Some((idx, job)) = pending.next() else {
                break;
            };
            let fut = f(job);
            join_set.spawn(async move { (idx, fut.await) });
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let failure = match joined.context("join pool task") {
            Ok((idx, Ok(value))) => {
                results[idx] = Some(value);
                done += 1;
                None
            }
            Ok((idx, Err(err))) => Some(err.context(format!("job {idx}"))),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            tracing::debug!(done, total, "pool drained after failure");
            return Err(err);
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(idx, value)| value.with_context(|| format!("job {idx} produced no result")))
        .collect()
}

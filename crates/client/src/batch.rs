//! Log-and-continue batch fetching
//!
//! Bulk jobs must not abort because one item is missing upstream or one
//! fetch failed: the runner records the outcome per item and keeps going.

use std::time::Duration;

use fetchguard_core::{Clock, JitterSource, SharedStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{FetchOptions, Fetched, Orchestrator};
use crate::transport::{ApiRequest, Transport};

const DEFAULT_QUOTA_WAIT: Duration = Duration::from_secs(60 * 60);

/// Outcome tally for one batch run
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub absent: usize,
    pub failed: usize,
    /// The failed requests with a human-readable reason each
    pub errors: Vec<(ApiRequest, String)>,
}

impl BatchSummary {
    /// Items processed, regardless of outcome
    pub fn total(&self) -> usize {
        self.succeeded + self.absent + self.failed
    }
}

/// Sequentially fetches a list of requests through an [`Orchestrator`]
///
/// Every item is fetched with absence allowed and quota waiting enabled, so
/// a batch paces itself against the hourly budget instead of failing when
/// the buffer cuts off mid-run.
pub struct BatchRunner<'a, T, S, C, J>
where
    T: Transport,
    S: SharedStore,
    C: Clock,
    J: JitterSource,
{
    orchestrator: &'a Orchestrator<T, S, C, J>,
    quota_wait: Duration,
    cancel: CancellationToken,
}

impl<'a, T, S, C, J> BatchRunner<'a, T, S, C, J>
where
    T: Transport,
    S: SharedStore,
    C: Clock,
    J: JitterSource,
{
    pub fn new(orchestrator: &'a Orchestrator<T, S, C, J>) -> Self {
        Self { orchestrator, quota_wait: DEFAULT_QUOTA_WAIT, cancel: CancellationToken::new() }
    }

    /// Maximum time to block per item when the quota is exhausted
    pub fn quota_wait(mut self, max_wait: Duration) -> Self {
        self.quota_wait = max_wait;
        self
    }

    /// Stops the run between items and aborts in-flight waits
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fetch every item, logging and counting failures instead of aborting
    pub async fn run(&self, items: impl IntoIterator<Item = ApiRequest>) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for request in items {
            if self.cancel.is_cancelled() {
                info!(processed = summary.total(), "batch cancelled; stopping early");
                break;
            }

            let options = FetchOptions::new()
                .allow_not_found()
                .wait_for_quota(self.quota_wait)
                .cancel_token(self.cancel.clone());

            match self.orchestrator.fetch(&request, &options).await {
                Ok(Fetched::Absent) => {
                    info!(endpoint = %request.endpoint, "item absent upstream; continuing");
                    summary.absent += 1;
                }
                Ok(_) => summary.succeeded += 1,
                Err(err) => {
                    warn!(
                        endpoint = %request.endpoint,
                        error = %err,
                        "batch item failed; continuing"
                    );
                    summary.failed += 1;
                    summary.errors.push((request, err.to_string()));
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            absent = summary.absent,
            failed = summary.failed,
            "batch run complete"
        );
        summary
    }
}

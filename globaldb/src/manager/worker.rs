//! Background worker keeping the account topology fresh.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RefreshConfig;
use crate::errors::TopologyError;
use crate::topology::{AccountFetcher, LocationCache};

#[derive(Debug)]
pub(crate) struct RefreshRequest {
    pub(crate) force: bool,
    pub(crate) response_chan: tokio::sync::oneshot::Sender<Result<(), TopologyError>>,
}

/// Works in the background to keep the topology updated.
///
/// Refreshes periodically and on demand. A failed fetch keeps the last
/// known topology in place and shortens the next attempt's interval; it
/// never propagates to request dispatch.
pub(crate) struct TopologyWorker {
    pub(crate) cache: Arc<LocationCache>,
    pub(crate) fetcher: Arc<dyn AccountFetcher>,
    pub(crate) refresh_channel: tokio::sync::mpsc::Receiver<RefreshRequest>,
    pub(crate) config: RefreshConfig,
}

impl TopologyWorker {
    pub(crate) async fn work(mut self) {
        let mut last_refresh_time = Instant::now();
        let mut fetch_works = true;

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            // Wait until it's time for the next refresh
            let sleep_until: Instant = last_refresh_time
                .checked_add(if fetch_works {
                    self.config.refresh_interval
                } else {
                    self.config.failed_refresh_retry_interval
                })
                .unwrap_or_else(Instant::now);

            let sleep_future = tokio::time::sleep_until(sleep_until);
            tokio::pin!(sleep_future);

            tokio::select! {
                _sleep_finished = sleep_future => {
                    // Time to do the periodic refresh.
                },

                maybe_refresh_request = self.refresh_channel.recv() => {
                    match maybe_refresh_request {
                        Some(request) => {
                            if !request.force
                                && last_refresh_time.elapsed() < self.config.min_refresh_interval
                            {
                                // Coalesce: the topology was refreshed a moment ago.
                                let _ = request.response_chan.send(Ok(()));
                                continue;
                            }
                            cur_request = Some(request);
                        }
                        None => return, // If refresh_channel was closed then the manager was dropped, we can stop working
                    }
                }
            }

            debug!("Requesting account topology refresh");
            last_refresh_time = Instant::now();
            let refresh_res = self.perform_refresh().await;

            fetch_works = refresh_res.is_ok();

            // Send the refresh result if there was a request
            if let Some(request) = cur_request {
                // We can ignore sending error - if no one waits for the response we can drop it
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    async fn perform_refresh(&mut self) -> Result<(), TopologyError> {
        match self.fetcher.fetch_account().await {
            Ok(account) => {
                self.cache.update(&account);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Account topology refresh failed, keeping the last known topology: {}",
                    err
                );
                Err(err)
            }
        }
    }
}

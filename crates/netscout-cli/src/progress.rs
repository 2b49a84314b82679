//! Diagnostics progress display.

use indicatif::{ProgressBar, ProgressStyle};
use netscout_discovery::{AddressPool, DiagnosticsState};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Progress bar over the entries of a pool
pub struct DiagnosticsProgress {
    bar: ProgressBar,
}

impl DiagnosticsProgress {
    /// Create a progress bar for `entries` addresses
    #[must_use]
    pub fn new(entries: usize) -> Self {
        let bar = ProgressBar::new(entries as u64);

        // Fall back to the default style if the template is rejected
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message("diagnosing addresses");
        bar.enable_steady_tick(POLL_INTERVAL);

        Self { bar }
    }

    /// Follow `pool` until every entry is diagnosed
    pub async fn track(&self, pool: &AddressPool) {
        loop {
            let mut finished = 0;
            for entry in pool.entries() {
                if pool
                    .state_of(entry.key())
                    .await
                    .is_some_and(DiagnosticsState::is_finished)
                {
                    finished += 1;
                }
            }
            self.bar.set_position(finished as u64);

            if finished >= pool.entry_count() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Finish with a summary message
    pub fn finish(&self, entries: usize) {
        self.bar
            .finish_with_message(format!("{entries} address(es) diagnosed"));
    }
}

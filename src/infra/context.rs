//! Process-wide context built once in `main`
//!
//! Holds the configuration and the collaborator handles every component
//! needs. Components receive it explicitly; there is no global state.

use crate::infra::clock::{Clock, SystemClock};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::retry::RetryPolicy;
use crate::io::directory::{Directory, HttpDirectory};
use crate::io::ledger::{HttpLedger, LedgerService};
use crate::io::rest::{CollaboratorError, RestClient};
use crate::io::schedule::{EventSchedule, HttpSchedule};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub ledger: Arc<dyn LedgerService>,
    pub directory: Arc<dyn Directory>,
    /// Present only when open hours gating is enabled
    pub schedule: Option<Arc<dyn EventSchedule>>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
}

impl AppContext {
    /// Wire the HTTP collaborators described by `config`
    pub fn connect(config: Config) -> Result<Self, CollaboratorError> {
        let retry = RetryPolicy::from_config(config.retry());

        let ledger =
            RestClient::new("ledger", config.ledger_url(), config.ledger_timeout(), retry.clone())?;
        let directory = RestClient::new(
            "directory",
            config.directory_url(),
            config.directory_timeout(),
            retry.clone(),
        )?;
        let schedule: Option<Arc<dyn EventSchedule>> = if config.schedule_enabled() {
            let rest =
                RestClient::new("schedule", config.schedule_url(), config.schedule_timeout(), retry)?;
            Some(Arc::new(HttpSchedule::new(rest, config.schedule_group())))
        } else {
            None
        };

        Ok(Self {
            ledger: Arc::new(HttpLedger::new(ledger)),
            directory: Arc::new(HttpDirectory::new(directory)),
            schedule,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(Metrics::new()),
            config,
        })
    }

    /// Context over caller-supplied collaborators (tests, bench setups)
    pub fn with_collaborators(
        config: Config,
        ledger: Arc<dyn LedgerService>,
        directory: Arc<dyn Directory>,
        schedule: Option<Arc<dyn EventSchedule>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schedule = schedule.filter(|_| config.schedule_enabled());
        Self { config, ledger, directory, schedule, clock, metrics: Arc::new(Metrics::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_without_schedule() {
        let ctx = AppContext::connect(Config::default()).unwrap();
        assert!(ctx.schedule.is_none());
    }

    #[test]
    fn test_connect_with_schedule() {
        let config = Config::default().with_schedule_enabled(true);
        let ctx = AppContext::connect(config).unwrap();
        assert!(ctx.schedule.is_some());
    }
}

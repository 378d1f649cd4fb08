//! Read-only queries: job history and the access point environment

use crate::domain::{AccessPoint, CardId, ChargeRecord, InputError};
use crate::infra::context::AppContext;
use crate::io::directory::Directory;
use crate::io::ledger::{LedgerQuery, LedgerService};
use crate::io::rest::CollaboratorError;
use crate::services::access::JobError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const HISTORY_PAGE_SIZE: usize = 15;

/// One-based page number; missing or values below 1 mean the first page
pub fn parse_page(raw: Option<&str>) -> Result<usize, InputError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(1);
    };
    let page: i64 = raw.parse().map_err(|_| InputError::MalformedPage(raw.to_string()))?;
    Ok(usize::try_from(page.max(1)).unwrap_or(1))
}

pub struct RecordsService {
    ledger: Arc<dyn LedgerService>,
    directory: Arc<dyn Directory>,
}

impl RecordsService {
    pub fn new(ctx: &AppContext) -> Self {
        Self { ledger: ctx.ledger.clone(), directory: ctx.directory.clone() }
    }

    /// A page of the card holder's charge records, newest first
    pub async fn job_history(
        &self,
        access_point: &AccessPoint,
        card_raw: &str,
        page_raw: Option<&str>,
    ) -> Result<Vec<ChargeRecord>, JobError> {
        let card = CardId::parse(card_raw)?;
        let page = parse_page(page_raw)?;
        let contact = match self.directory.contact_by_card(&card).await {
            Ok(contact) => contact,
            Err(CollaboratorError::NotFound) => return Err(JobError::UnknownCard),
            Err(e) => return Err(JobError::Unavailable(e)),
        };
        let offset = (page - 1).saturating_mul(HISTORY_PAGE_SIZE);
        let query = LedgerQuery::page(contact.id, HISTORY_PAGE_SIZE, offset);
        let records = self.ledger.get(&query).await.map_err(|e| {
            warn!(contact_id = %contact.id, error = %e, "job_history_failed");
            JobError::Unavailable(e)
        })?;
        debug!(
            access_point_id = %access_point.id,
            contact_id = %contact.id,
            page = %page,
            count = %records.len(),
            "job_history"
        );
        Ok(records)
    }

    /// Access point names by id, the caller's id and its error code labels
    pub async fn environment(
        &self,
        access_point: &AccessPoint,
    ) -> Result<BTreeMap<String, String>, CollaboratorError> {
        let labels = match self.directory.error_labels(access_point.id).await {
            Ok(labels) => labels,
            Err(CollaboratorError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let access_points = self.directory.access_points().await?;

        let mut environment = BTreeMap::new();
        for ap in access_points {
            environment.insert(ap.id.to_string(), ap.short_name);
        }
        environment.insert("access_point_id".to_string(), access_point.id.to_string());
        for label in labels {
            environment.insert(label.error_key, label.error_value);
        }
        Ok(environment)
    }
}

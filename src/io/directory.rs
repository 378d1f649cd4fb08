//! Directory collaborator - access points, card holders and UI labels

use crate::domain::{AccessPoint, AccessPointId, CardId, Contact};
use crate::io::rest::{CollaboratorError, RestClient};
use crate::io::wire::{AccessPointRow, ContactRow, ErrorLabel};
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::warn;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Access point registered for a network origin
    async fn access_point_by_origin(&self, origin: IpAddr) -> Result<AccessPoint, CollaboratorError>;

    /// Card holder for a card serial
    async fn contact_by_card(&self, card: &CardId) -> Result<Contact, CollaboratorError>;

    /// Every registered access point
    async fn access_points(&self) -> Result<Vec<AccessPoint>, CollaboratorError>;

    /// UI labels for error codes on one access point
    async fn error_labels(&self, id: AccessPointId) -> Result<Vec<ErrorLabel>, CollaboratorError>;
}

/// Directory reached over its REST interface
pub struct HttpDirectory {
    rest: RestClient,
}

impl HttpDirectory {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

fn invalid_row(kind: &str, e: impl std::fmt::Display) -> CollaboratorError {
    warn!(kind = %kind, error = %e, "directory_row_invalid");
    CollaboratorError::Unexpected(format!("{kind}: {e}"))
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn access_point_by_origin(&self, origin: IpAddr) -> Result<AccessPoint, CollaboratorError> {
        let rows: Vec<AccessPointRow> =
            self.rest.get_json("access_points", &[("origin", origin.to_string())]).await?;
        let row = rows.into_iter().next().ok_or(CollaboratorError::NotFound)?;
        AccessPoint::try_from(row).map_err(|e| invalid_row("access_point", e))
    }

    async fn contact_by_card(&self, card: &CardId) -> Result<Contact, CollaboratorError> {
        let rows: Vec<ContactRow> =
            self.rest.get_json("contacts", &[("card", card.to_string())]).await?;
        let row = rows.into_iter().next().ok_or(CollaboratorError::NotFound)?;
        Contact::try_from(row).map_err(|e| invalid_row("contact", e))
    }

    async fn access_points(&self) -> Result<Vec<AccessPoint>, CollaboratorError> {
        let rows: Vec<AccessPointRow> = self.rest.get_json("access_points", &[]).await?;
        rows.into_iter()
            .map(|row| AccessPoint::try_from(row).map_err(|e| invalid_row("access_point", e)))
            .collect()
    }

    async fn error_labels(&self, id: AccessPointId) -> Result<Vec<ErrorLabel>, CollaboratorError> {
        self.rest.get_json(&format!("access_points/{id}/error_codes"), &[]).await
    }
}

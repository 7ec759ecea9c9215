//! Escrow coordination.
//!
//! Thin orchestration over the ledger, keyed by campaign: settlements credit
//! the right party and flip the assignment's settlement flag in the same
//! transaction as the ledger write, so a settled assignment always has its
//! ledger entry and vice versa.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::db::{campaigns, ledger, Database, DbError, LedgerEntry, LedgerError};
use crate::error::ErrorKind;

/// Escrow operation errors.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl EscrowError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ledger(e) => e.kind(),
            Self::Db(e) => e.kind(),
        }
    }

    /// Whether this failure means the settlement was already applied, which
    /// callers in the verification pipeline tolerate.
    pub fn is_already_settled(&self) -> bool {
        matches!(self, Self::Ledger(LedgerError::AlreadySettled(_)))
    }
}

/// Escrow coordinator.
#[derive(Clone)]
pub struct EscrowService {
    db: Database,
}

impl EscrowService {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Credit a user's balance.
    pub async fn deposit(
        &self,
        user_id: i64,
        amount: Decimal,
        note: Option<&str>,
    ) -> Result<LedgerEntry, EscrowError> {
        Ok(self.db.ledger().deposit(user_id, amount, note).await?)
    }

    /// Hold the campaign price in escrow.
    pub async fn hold(&self, campaign_id: i64) -> Result<LedgerEntry, EscrowError> {
        Ok(self.db.ledger().hold(campaign_id).await?)
    }

    /// Release held funds to the recipient and mark the assignment settled.
    pub async fn release(
        &self,
        campaign_id: i64,
        recipient_id: i64,
    ) -> Result<LedgerEntry, EscrowError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;
        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        let entry = ledger::release_tx(&mut tx, &campaign, recipient_id).await?;
        campaigns::mark_settled_tx(&mut tx, campaign_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(campaign_id, recipient_id, "Settlement applied: release");
        Ok(entry)
    }

    /// Return held funds to the advertiser and mark the assignment settled.
    pub async fn refund(&self, campaign_id: i64) -> Result<LedgerEntry, EscrowError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::from)?;
        let campaign = campaigns::fetch_campaign_tx(&mut tx, campaign_id).await?;
        let entry = ledger::refund_tx(&mut tx, &campaign).await?;
        campaigns::mark_settled_tx(&mut tx, campaign_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(campaign_id, "Settlement applied: refund");
        Ok(entry)
    }

    /// Current balance of a user.
    pub async fn balance_of(&self, user_id: i64) -> Result<Decimal, EscrowError> {
        Ok(self.db.ledger().balance_of(user_id).await?)
    }

    /// Amount currently held for a campaign, if any.
    pub async fn held_amount(&self, campaign_id: i64) -> Result<Option<Decimal>, EscrowError> {
        Ok(self.db.ledger().held_amount(campaign_id).await?)
    }

    /// Ledger entries for a user, newest first.
    pub async fn transactions_for_user(
        &self,
        user_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, EscrowError> {
        Ok(self.db.ledger().entries_for_user(user_id, limit).await?)
    }

    /// Ledger entries for a campaign, oldest first.
    pub async fn transactions_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<LedgerEntry>, EscrowError> {
        Ok(self.db.ledger().entries_for_campaign(campaign_id).await?)
    }
}

//! Bulk Staging Pipeline.
//!
//! A run pages through the CRM leads created in a date range, stages every
//! lead and contact write-once, then merges the staged rows into the primary
//! tables in one transaction. Staged rows of a failed or reviewable run are
//! kept for inspection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use fleetsync_core::config::{AppConfig, BulkImportConfig};
use fleetsync_core::domain::import::{
    DateRange, ImportCounts, ImportRun, ImportRunId, ImportRunStatus, StagedContact, StagedLead,
};
use fleetsync_core::fields::LeadSnapshot;
use fleetsync_core::line_items::rental_days;
use fleetsync_core::stages::StageMapper;
use fleetsync_db::{DbPool, SqlStagingRepository, StagingRepository};

use crate::errors::BulkImportError;
use crate::ports::{CrmContact, CrmGateway, CrmLead, GatewayError};

/// Contacts fetched between two pauses.
const CONTACT_BATCH: usize = 50;

struct StagedPages {
    contact_ids: BTreeSet<String>,
    /// The page limit stopped the run while the crm still had leads.
    truncated: bool,
}

pub struct BulkImporter {
    crm: Arc<dyn CrmGateway>,
    staging: Arc<dyn StagingRepository>,
    mapper: StageMapper,
    pipeline_id: Option<String>,
    settings: BulkImportConfig,
    call_timeout: StdDuration,
}

impl BulkImporter {
    pub fn new(
        crm: Arc<dyn CrmGateway>,
        staging: Arc<dyn StagingRepository>,
        mapper: StageMapper,
        pipeline_id: Option<String>,
        settings: BulkImportConfig,
        call_timeout: StdDuration,
    ) -> Self {
        Self { crm, staging, mapper, pipeline_id, settings, call_timeout }
    }

    pub fn from_config(pool: DbPool, config: &AppConfig, crm: Arc<dyn CrmGateway>) -> Self {
        Self::new(
            crm,
            Arc::new(SqlStagingRepository::new(pool)),
            config.crm.stage_mapper(),
            config.crm.pipeline_id.clone(),
            config.bulk_import.clone(),
            StdDuration::from_secs(config.sync.call_timeout_secs.max(1)),
        )
    }

    pub fn validate(&self, range: &DateRange) -> Result<(), BulkImportError> {
        if !self.settings.enabled {
            return Err(BulkImportError::Disabled);
        }
        if range.days() > self.settings.max_range_days {
            return Err(BulkImportError::InvalidRange(format!(
                "{} spans {} days; the limit is {}",
                range.label(),
                range.days(),
                self.settings.max_range_days
            )));
        }
        Ok(())
    }

    /// Validates and records a new `running` run. [`Self::execute`] does the work.
    pub async fn start(&self, range: DateRange) -> Result<ImportRun, BulkImportError> {
        self.validate(&range)?;
        let run = ImportRun {
            id: ImportRunId(format!("IMP-{}", Uuid::new_v4().simple())),
            status: ImportRunStatus::Running,
            range,
            counts: ImportCounts::default(),
            pages_fetched: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.staging.save_run(&run).await?;
        info!(
            event_name = "bulk.run.started",
            run_id = %run.id,
            range = %range.label(),
            "bulk import run started"
        );
        Ok(run)
    }

    /// Start and execute in one call.
    pub async fn run(&self, range: DateRange) -> Result<ImportRun, BulkImportError> {
        let run = self.start(range).await?;
        self.execute(run).await
    }

    /// Drives a started run to a final status. A failure inside the run is
    /// recorded on it; only failing to persist the final state is an error.
    pub async fn execute(&self, mut run: ImportRun) -> Result<ImportRun, BulkImportError> {
        if let Err(cause) = self.stage_and_merge(&mut run).await {
            warn!(
                event_name = "bulk.run.failed",
                run_id = %run.id,
                pages_fetched = run.pages_fetched,
                error = %cause,
                "bulk import run failed; staged rows are kept"
            );
            match self.staging.staged_counts(&run.id).await {
                Ok(staged) => {
                    run.counts = ImportCounts {
                        leads: staged.leads,
                        contacts: staged.contacts,
                        vehicles: 0,
                        rejected: staged.rejected,
                    };
                }
                Err(count_error) => {
                    warn!(run_id = %run.id, error = %count_error, "staged counts unavailable");
                }
            }
            run.status = ImportRunStatus::Failed;
            run.error = Some(cause.to_string());
            run.finished_at = Some(Utc::now());
            self.staging.save_run(&run).await?;
        }

        info!(
            event_name = "bulk.run.finalized",
            run_id = %run.id,
            status = run.status.as_str(),
            leads = run.counts.leads,
            contacts = run.counts.contacts,
            vehicles = run.counts.vehicles,
            rejected = run.counts.rejected,
            pages_fetched = run.pages_fetched,
            "bulk import run finished"
        );
        Ok(run)
    }

    pub async fn find_run(&self, id: &ImportRunId) -> Result<ImportRun, BulkImportError> {
        self.staging.find_run(id).await?.ok_or_else(|| BulkImportError::RunNotFound(id.clone()))
    }

    async fn stage_and_merge(&self, run: &mut ImportRun) -> Result<(), BulkImportError> {
        let StagedPages { contact_ids, truncated } = self.stage_leads(run).await?;
        self.stage_contacts(&run.id, contact_ids).await?;

        let merged = self.staging.merge_run(&run.id, Utc::now()).await?;
        let staged = self.staging.staged_counts(&run.id).await?;
        run.counts = ImportCounts {
            leads: merged.bookings,
            contacts: merged.clients,
            vehicles: merged.vehicles,
            rejected: staged.rejected,
        };
        run.status = if staged.rejected > 0 || truncated {
            ImportRunStatus::NeedsReview
        } else {
            ImportRunStatus::Succeeded
        };
        if truncated {
            run.error = Some(format!(
                "stopped after {} page(s) while the crm reported more leads",
                run.pages_fetched
            ));
        }
        run.finished_at = Some(Utc::now());
        self.staging.save_run(run).await?;

        if run.status == ImportRunStatus::Succeeded {
            match self.staging.purge_staged(&run.id).await {
                Ok(purged) => info!(event_name = "bulk.run.purged", run_id = %run.id, purged),
                Err(cause) => warn!(
                    event_name = "bulk.run.purge_failed",
                    run_id = %run.id,
                    error = %cause,
                    "staged rows of a finished run could not be removed"
                ),
            }
        }
        Ok(())
    }

    /// Stages every page and collects the contact ids referenced by accepted leads.
    async fn stage_leads(&self, run: &mut ImportRun) -> Result<StagedPages, BulkImportError> {
        let mut contact_ids = BTreeSet::new();
        let mut truncated = false;
        let page_size = self.settings.page_size.max(1);

        for page_number in 1..=self.settings.max_pages.max(1) {
            if page_number > 1 {
                self.pause().await;
            }
            let page = self
                .bounded("crm.list_leads", self.crm.list_leads(&run.range, page_number, page_size))
                .await?;
            run.pages_fetched = page_number;

            let mut staged = 0_u32;
            for lead in &page.leads {
                if !self.is_importable(lead) {
                    continue;
                }
                let row = self.staged_lead(&run.id, lead)?;
                if row.parse_error.is_none() {
                    if let Some(contact_id) = &row.contact_id {
                        contact_ids.insert(contact_id.clone());
                    }
                }
                if self.staging.stage_lead(&row).await? {
                    staged += 1;
                }
            }
            self.staging.save_run(run).await?;
            info!(
                event_name = "bulk.page.staged",
                run_id = %run.id,
                page = page_number,
                received = page.leads.len(),
                staged,
                "lead page staged"
            );

            if !page.has_more || page.leads.is_empty() {
                break;
            }
            if page_number == self.settings.max_pages.max(1) {
                truncated = true;
                warn!(
                    event_name = "bulk.page.limit_reached",
                    run_id = %run.id,
                    max_pages = self.settings.max_pages,
                    "page limit reached before the crm ran out of leads"
                );
            }
        }
        Ok(StagedPages { contact_ids, truncated })
    }

    async fn stage_contacts(
        &self,
        run_id: &ImportRunId,
        contact_ids: BTreeSet<String>,
    ) -> Result<(), BulkImportError> {
        let ids: Vec<String> = contact_ids.into_iter().collect();
        let concurrency = self.settings.contact_concurrency.max(1);

        for (index, batch) in ids.chunks(CONTACT_BATCH).enumerate() {
            if index > 0 {
                self.pause().await;
            }
            // Owned ids keep the spawned `execute` future `Send`.
            let fetched: Vec<(String, Result<CrmContact, GatewayError>)> =
                stream::iter(batch.iter().cloned())
                    .map(|id| async move {
                        let result =
                            self.bounded("crm.get_contact", self.crm.get_contact(&id)).await;
                        (id, result)
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;

            for (id, result) in fetched {
                match result {
                    Ok(contact) => {
                        self.staging.stage_contact(&staged_contact(run_id, contact)?).await?;
                    }
                    Err(GatewayError::Status { status: 404, .. }) => {
                        warn!(
                            event_name = "bulk.contact.missing",
                            run_id = %run_id,
                            contact_id = %id,
                            "contact no longer exists; its bookings merge without a client"
                        );
                    }
                    Err(cause) => return Err(cause.into()),
                }
            }
        }
        Ok(())
    }

    fn is_importable(&self, lead: &CrmLead) -> bool {
        if self.settings.excluded_stage_ids.iter().any(|stage| stage == &lead.stage_id) {
            return false;
        }
        match (&self.pipeline_id, &lead.pipeline_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }

    fn staged_lead(&self, run_id: &ImportRunId, lead: &CrmLead) -> Result<StagedLead, BulkImportError> {
        let snapshot = LeadSnapshot::extract(&lead.custom_fields, self.mapper.fields());
        let parse_error = match (snapshot.start_at, snapshot.end_at) {
            (None, _) | (_, None) => Some("missing rental start or end date".to_string()),
            (Some(start), Some(end)) if end <= start => {
                Some("rental end is not after rental start".to_string())
            }
            _ => None,
        };

        let daily_rate = snapshot.daily_rate.unwrap_or(Decimal::ZERO);
        let days = Decimal::from(rental_days(snapshot.start_at, snapshot.end_at));
        let total_amount = match lead.price.filter(|price| *price > Decimal::ZERO) {
            Some(price) => price,
            None => daily_rate * days,
        };

        Ok(StagedLead {
            run_id: run_id.clone(),
            external_lead_id: lead.id.clone(),
            stage_id: lead.stage_id.clone(),
            status: self.mapper.status_for(&lead.stage_id),
            contact_id: lead.contact_id.clone(),
            vehicle_plate: snapshot.vehicle_plate,
            currency: snapshot.currency.unwrap_or_else(|| "EUR".to_string()),
            daily_rate,
            total_amount,
            advance_payment: snapshot.advance_payment.unwrap_or(Decimal::ZERO),
            start_at: snapshot.start_at,
            end_at: snapshot.end_at,
            pickup_location: snapshot.pickup_location,
            dropoff_location: snapshot.dropoff_location,
            payload_json: serde_json::to_string(lead)?,
            parse_error,
        })
    }

    async fn bounded<T, Fut>(&self, operation: &str, future: Fut) -> Result<T, GatewayError>
    where
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        tokio::time::timeout(self.call_timeout, future).await.unwrap_or_else(|_| {
            Err(GatewayError::Timeout {
                operation: operation.to_string(),
                seconds: self.call_timeout.as_secs(),
            })
        })
    }

    async fn pause(&self) {
        if self.settings.inter_batch_delay_ms > 0 {
            tokio::time::sleep(StdDuration::from_millis(self.settings.inter_batch_delay_ms)).await;
        }
    }
}

fn staged_contact(run_id: &ImportRunId, contact: CrmContact) -> Result<StagedContact, BulkImportError> {
    let payload_json = serde_json::to_string(&contact)?;
    Ok(StagedContact {
        run_id: run_id.clone(),
        external_contact_id: contact.id,
        name: contact.name,
        email: contact.email,
        phone: contact.phone,
        document_type: contact.document_type,
        document_number: contact.document_number,
        address: contact.address,
        payload_json,
    })
}

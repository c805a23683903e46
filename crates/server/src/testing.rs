//! Stand-ins for the CRM and accounting system used by the router tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use fleetsync_core::config::AppConfig;
use fleetsync_core::domain::import::DateRange;
use fleetsync_core::domain::order::{CustomerProfile, OrderPayload, ProvisionedOrder};
use fleetsync_db::{connect_with_settings, migrations, DbPool};
use fleetsync_engine::ports::{
    AccountingCustomer, AccountingGateway, CrmContact, CrmGateway, CrmLead, GatewayError, LeadPage,
    LeadStatusUpdate, TaskGateway, TaskRequest,
};
use fleetsync_engine::Gateways;

use crate::api::ApiState;
use crate::bootstrap::{assemble, Application};

pub async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

pub fn lead(id: &str, stage_id: &str) -> CrmLead {
    let field = |id: &str, value: Value| json!({ "field_id": id, "values": [{ "value": value }] });
    CrmLead {
        id: id.to_string(),
        name: Some(format!("Rental {id}")),
        pipeline_id: None,
        stage_id: stage_id.to_string(),
        contact_id: Some(format!("CT-{id}")),
        price: None,
        created_at: None,
        custom_fields: json!([
            field("daily_rate", json!(60)),
            field("currency", json!("EUR")),
            field("rental_start", json!("2026-07-01T09:00:00Z")),
            field("rental_end", json!("2026-07-03T09:00:00Z")),
            field("vehicle_plate", json!("XY987ZT")),
        ]),
    }
}

fn unavailable(operation: &str) -> GatewayError {
    GatewayError::Status { operation: operation.to_string(), status: 503, body: String::new() }
}

#[derive(Default)]
pub struct StubCrm {
    pub leads: Mutex<HashMap<String, CrmLead>>,
}

impl StubCrm {
    pub fn with_lead(self, lead: CrmLead) -> Self {
        self.leads.lock().expect("lock").insert(lead.id.clone(), lead);
        self
    }
}

#[async_trait]
impl CrmGateway for StubCrm {
    async fn get_lead(&self, lead_id: &str) -> Result<CrmLead, GatewayError> {
        self.leads.lock().expect("lock").get(lead_id).cloned().ok_or_else(|| {
            GatewayError::Status { operation: "crm.get_lead".to_string(), status: 404, body: String::new() }
        })
    }

    async fn update_lead_status(
        &self,
        _lead_id: &str,
        _update: &LeadStatusUpdate,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<CrmContact, GatewayError> {
        Ok(CrmContact {
            id: contact_id.to_string(),
            name: format!("Client {contact_id}"),
            email: Some(format!("{}@example.com", contact_id.to_ascii_lowercase())),
            phone: None,
            document_type: None,
            document_number: None,
            address: None,
        })
    }

    async fn list_leads(
        &self,
        _range: &DateRange,
        _page: u32,
        _page_size: u32,
    ) -> Result<LeadPage, GatewayError> {
        Ok(LeadPage::default())
    }
}

#[async_trait]
impl TaskGateway for StubCrm {
    async fn create_task(&self, _task: &TaskRequest) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct StubAccounting {
    pub orders: AtomicUsize,
    pub failures_left: AtomicUsize,
}

#[async_trait]
impl AccountingGateway for StubAccounting {
    async fn find_customer_by_email(
        &self,
        _email: &str,
    ) -> Result<Option<AccountingCustomer>, GatewayError> {
        Ok(None)
    }

    async fn create_customer(
        &self,
        _profile: &CustomerProfile,
    ) -> Result<AccountingCustomer, GatewayError> {
        Ok(AccountingCustomer { id: "CUST-1".to_string() })
    }

    async fn create_order(
        &self,
        _payload: &OrderPayload,
        _idempotency_key: &str,
    ) -> Result<ProvisionedOrder, GatewayError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(unavailable("accounting.create_order"));
        }
        let number = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProvisionedOrder {
            order_id: format!("SO-{number}"),
            order_url: format!("https://acc.example/sales-orders/SO-{number}"),
        })
    }

    async fn update_order(&self, _order_id: &str, _payload: &OrderPayload) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub struct TestApp {
    pub app: Application,
    pub accounting: Arc<StubAccounting>,
}

impl TestApp {
    pub async fn new(config: AppConfig, crm: StubCrm, accounting: StubAccounting) -> Self {
        let crm = Arc::new(crm);
        let accounting = Arc::new(accounting);
        let gateways = Gateways {
            crm: crm.clone(),
            accounting: accounting.clone(),
            tasks: crm,
            notifier: None,
        };
        let app = assemble(config, setup_pool().await, gateways).expect("assemble app");
        Self { app, accounting }
    }

    pub fn state(&self) -> ApiState {
        self.app.api_state()
    }
}

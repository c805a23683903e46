//! In-process fakes of the external systems.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use fleetsync_core::domain::import::DateRange;
use fleetsync_core::domain::order::{CustomerProfile, OrderPayload, ProvisionedOrder};
use fleetsync_db::{connect_with_settings, migrations, DbPool};

use crate::ports::{
    AccountingCustomer, AccountingGateway, CrmContact, CrmGateway, CrmLead, GatewayError,
    LeadPage, LeadStatusUpdate, Notifier, TaskGateway, TaskRequest,
};

pub async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

pub fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}

pub fn field(id: &str, value: Value) -> Value {
    json!({ "field_id": id, "values": [{ "value": value }] })
}

pub fn lead(id: &str, stage_id: &str, advance_payment: Option<i64>) -> CrmLead {
    let mut fields = vec![
        field("daily_rate", json!(45)),
        field("currency", json!("eur")),
        field("rental_start", json!("2026-06-01T10:00:00Z")),
        field("rental_end", json!("2026-06-04T10:00:00Z")),
        field("pickup_location", json!("Airport")),
        field("vehicle_plate", json!("ab 123 cd")),
    ];
    if let Some(advance) = advance_payment {
        fields.push(field("advance_payment", json!(advance)));
    }
    CrmLead {
        id: id.to_string(),
        name: Some(format!("Rental {id}")),
        pipeline_id: None,
        stage_id: stage_id.to_string(),
        contact_id: Some(format!("CT-{id}")),
        price: None,
        created_at: Some(ts("2025-05-10T09:00:00Z")),
        custom_fields: Value::Array(fields),
    }
}

pub fn contact(id: &str) -> CrmContact {
    CrmContact {
        id: id.to_string(),
        name: format!("Client {id}"),
        email: Some(format!("{}@example.com", id.to_ascii_lowercase())),
        phone: None,
        document_type: Some("passport".to_string()),
        document_number: Some("P1234567".to_string()),
        address: None,
    }
}

fn unavailable(operation: &str) -> GatewayError {
    GatewayError::Status { operation: operation.to_string(), status: 503, body: String::new() }
}

#[derive(Default)]
pub struct FakeCrm {
    pub leads: Mutex<HashMap<String, CrmLead>>,
    pub contacts: Mutex<HashMap<String, CrmContact>>,
    pub pages: Mutex<Vec<LeadPage>>,
    pub updates: Mutex<Vec<(String, LeadStatusUpdate)>>,
    pub failing_updates: Mutex<VecDeque<GatewayError>>,
    pub failing_pages: Mutex<Vec<u32>>,
    pub contact_lookups: AtomicUsize,
}

impl FakeCrm {
    pub fn with_lead(self, lead: CrmLead) -> Self {
        if let Some(contact_id) = &lead.contact_id {
            self.contacts.lock().expect("lock").insert(contact_id.clone(), contact(contact_id));
        }
        self.leads.lock().expect("lock").insert(lead.id.clone(), lead);
        self
    }

    pub fn updates(&self) -> Vec<(String, LeadStatusUpdate)> {
        self.updates.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CrmGateway for FakeCrm {
    async fn get_lead(&self, lead_id: &str) -> Result<CrmLead, GatewayError> {
        self.leads.lock().expect("lock").get(lead_id).cloned().ok_or_else(|| {
            GatewayError::Status { operation: "crm.get_lead".to_string(), status: 404, body: String::new() }
        })
    }

    async fn update_lead_status(
        &self,
        lead_id: &str,
        update: &LeadStatusUpdate,
    ) -> Result<(), GatewayError> {
        if let Some(error) = self.failing_updates.lock().expect("lock").pop_front() {
            return Err(error);
        }
        self.updates.lock().expect("lock").push((lead_id.to_string(), update.clone()));
        Ok(())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<CrmContact, GatewayError> {
        self.contact_lookups.fetch_add(1, Ordering::SeqCst);
        self.contacts.lock().expect("lock").get(contact_id).cloned().ok_or_else(|| {
            GatewayError::Status { operation: "crm.get_contact".to_string(), status: 404, body: String::new() }
        })
    }

    async fn list_leads(
        &self,
        _range: &DateRange,
        page: u32,
        _page_size: u32,
    ) -> Result<LeadPage, GatewayError> {
        if self.failing_pages.lock().expect("lock").contains(&page) {
            return Err(unavailable("crm.list_leads"));
        }
        let pages = self.pages.lock().expect("lock");
        let index = usize::try_from(page.saturating_sub(1)).expect("page index");
        Ok(pages.get(index).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeAccounting {
    pub customers_by_email: Mutex<HashMap<String, String>>,
    pub customers_created: AtomicUsize,
    pub customer_lookups: AtomicUsize,
    pub orders: Mutex<Vec<(OrderPayload, String)>>,
    pub updates: Mutex<Vec<(String, OrderPayload)>>,
    pub failing_orders: Mutex<VecDeque<GatewayError>>,
    pub order_delay: Option<Duration>,
}

impl FakeAccounting {
    pub fn orders(&self) -> Vec<(OrderPayload, String)> {
        self.orders.lock().expect("lock").clone()
    }

    pub fn fail_next_order(&self, error: GatewayError) {
        self.failing_orders.lock().expect("lock").push_back(error);
    }
}

#[async_trait]
impl AccountingGateway for FakeAccounting {
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountingCustomer>, GatewayError> {
        self.customer_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .customers_by_email
            .lock()
            .expect("lock")
            .get(email)
            .map(|id| AccountingCustomer { id: id.clone() }))
    }

    async fn create_customer(
        &self,
        profile: &CustomerProfile,
    ) -> Result<AccountingCustomer, GatewayError> {
        let number = self.customers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("CUST-{number}");
        if let Some(email) = &profile.email {
            self.customers_by_email.lock().expect("lock").insert(email.clone(), id.clone());
        }
        Ok(AccountingCustomer { id })
    }

    async fn create_order(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<ProvisionedOrder, GatewayError> {
        if let Some(delay) = self.order_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failing_orders.lock().expect("lock").pop_front() {
            return Err(error);
        }
        let mut orders = self.orders.lock().expect("lock");
        orders.push((payload.clone(), idempotency_key.to_string()));
        let order_id = format!("SO-{}", orders.len());
        Ok(ProvisionedOrder {
            order_url: format!("https://accounting.example/orders/{order_id}"),
            order_id,
        })
    }

    async fn update_order(&self, order_id: &str, payload: &OrderPayload) -> Result<(), GatewayError> {
        self.updates.lock().expect("lock").push((order_id.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTasks {
    pub tasks: Mutex<Vec<TaskRequest>>,
    pub failing: Mutex<VecDeque<GatewayError>>,
}

#[async_trait]
impl TaskGateway for FakeTasks {
    async fn create_task(&self, task: &TaskRequest) -> Result<(), GatewayError> {
        if let Some(error) = self.failing.lock().expect("lock").pop_front() {
            return Err(error);
        }
        self.tasks.lock().expect("lock").push(task.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub messages: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, text: &str) -> Result<(), GatewayError> {
        if self.fail {
            return Err(unavailable("chat.send"));
        }
        self.messages.lock().expect("lock").push(text.to_string());
        Ok(())
    }
}

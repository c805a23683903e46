//! `reqwest` implementations of the gateway traits.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use fleetsync_core::config::{AccountingConfig, CrmConfig};
use fleetsync_core::domain::import::DateRange;
use fleetsync_core::domain::order::{CustomerProfile, OrderPayload, ProvisionedOrder};

use crate::ports::{
    optional_string_or_number, string_or_number, AccountingCustomer, AccountingGateway,
    CrmContact, CrmGateway, CrmLead, GatewayError, LeadPage, LeadStatusUpdate, Notifier,
    TaskGateway, TaskRequest,
};

const MAX_ERROR_BODY: usize = 512;

fn build_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(Duration::from_secs(timeout_secs.max(1))).build()
}

fn classify(operation: &str, error: reqwest::Error, timeout_secs: u64) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout { operation: operation.to_string(), seconds: timeout_secs }
    } else if error.is_decode() {
        GatewayError::Decode { operation: operation.to_string(), message: error.to_string() }
    } else {
        GatewayError::Transport { operation: operation.to_string(), message: error.to_string() }
    }
}

pub(crate) fn status_error(operation: &str, status: u16, body: &str) -> GatewayError {
    let mut body = body.trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    GatewayError::Status { operation: operation.to_string(), status, body }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Shared send/check/decode path for one remote system.
#[derive(Clone)]
struct RestClient {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl RestClient {
    fn new(base_url: &str, timeout_secs: u64) -> Result<Self, reqwest::Error> {
        Ok(Self { client: build_client(timeout_secs)?, base_url: base_url.to_string(), timeout_secs })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|error| classify(operation, error, self.timeout_secs))?;
        let status = response.status();
        debug!(operation, status = status.as_u16(), "remote call returned");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(operation, status.as_u16(), &body))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = self.send(operation, request).await?;
        response.json::<T>().await.map_err(|error| GatewayError::Decode {
            operation: operation.to_string(),
            message: error.to_string(),
        })
    }
}

pub struct HttpCrmGateway {
    rest: RestClient,
    access_token: SecretString,
}

impl HttpCrmGateway {
    pub fn new(config: &CrmConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            rest: RestClient::new(&config.base_url, config.timeout_secs)?,
            access_token: config.access_token.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.access_token.expose_secret())
    }
}

#[async_trait]
impl CrmGateway for HttpCrmGateway {
    async fn get_lead(&self, lead_id: &str) -> Result<CrmLead, GatewayError> {
        let request = self.authorized(self.rest.client.get(self.rest.url(&format!("leads/{lead_id}"))));
        self.rest.json("crm.get_lead", request).await
    }

    async fn update_lead_status(
        &self,
        lead_id: &str,
        update: &LeadStatusUpdate,
    ) -> Result<(), GatewayError> {
        let request = self
            .authorized(self.rest.client.patch(self.rest.url(&format!("leads/{lead_id}"))))
            .json(update);
        self.rest.send("crm.update_lead_status", request).await.map(|_| ())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<CrmContact, GatewayError> {
        let request =
            self.authorized(self.rest.client.get(self.rest.url(&format!("contacts/{contact_id}"))));
        self.rest.json("crm.get_contact", request).await
    }

    async fn list_leads(
        &self,
        range: &DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<LeadPage, GatewayError> {
        let request = self.authorized(self.rest.client.get(self.rest.url("leads")).query(&[
            ("created_from", range.from.to_rfc3339()),
            ("created_to", range.to.to_rfc3339()),
            ("page", page.to_string()),
            ("limit", page_size.to_string()),
        ]));
        self.rest.json("crm.list_leads", request).await
    }
}

#[async_trait]
impl TaskGateway for HttpCrmGateway {
    async fn create_task(&self, task: &TaskRequest) -> Result<(), GatewayError> {
        let request = self.authorized(self.rest.client.post(self.rest.url("tasks"))).json(&json!({
            "entity_type": "lead",
            "entity_id": task.lead_id,
            "task_type": task.action.as_str(),
            "text": task.text,
            "complete_till": task.due_at.timestamp(),
        }));
        self.rest.send("crm.create_task", request).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct CustomerList {
    #[serde(default)]
    customers: Vec<AccountingCustomer>,
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CustomerBody<'a> {
    name: &'a str,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    tax_id: Option<&'a str>,
    tax_id_type: Option<&'a str>,
    address: Option<&'a str>,
}

pub struct HttpAccountingGateway {
    rest: RestClient,
    api_key: SecretString,
}

impl HttpAccountingGateway {
    pub fn new(config: &AccountingConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            rest: RestClient::new(&config.base_url, config.timeout_secs)?,
            api_key: config.api_key.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.api_key.expose_secret())
    }

    fn order_url(&self, order_id: &str) -> String {
        self.rest.url(&format!("sales-orders/{order_id}"))
    }
}

#[async_trait]
impl AccountingGateway for HttpAccountingGateway {
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountingCustomer>, GatewayError> {
        let request = self
            .authorized(self.rest.client.get(self.rest.url("customers")))
            .query(&[("email", email)]);
        let list: CustomerList = self.rest.json("accounting.find_customer", request).await?;
        Ok(list.customers.into_iter().next())
    }

    async fn create_customer(
        &self,
        profile: &CustomerProfile,
    ) -> Result<AccountingCustomer, GatewayError> {
        let body = CustomerBody {
            name: &profile.name,
            email: profile.email.as_deref(),
            phone: profile.phone.as_deref(),
            tax_id: profile.tax_id.as_deref(),
            tax_id_type: profile.tax_id_type.as_deref(),
            address: profile.address.as_deref(),
        };
        let request = self.authorized(self.rest.client.post(self.rest.url("customers"))).json(&body);
        self.rest.json("accounting.create_customer", request).await
    }

    async fn create_order(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<ProvisionedOrder, GatewayError> {
        let request = self
            .authorized(self.rest.client.post(self.rest.url("sales-orders")))
            .header("Idempotency-Key", idempotency_key)
            .json(payload);
        let created: CreatedOrder = self.rest.json("accounting.create_order", request).await?;
        if created.id.trim().is_empty() {
            return Err(GatewayError::Rejected {
                operation: "accounting.create_order".to_string(),
                message: "response carried an empty order id".to_string(),
            });
        }
        let order_url = created.url.unwrap_or_else(|| self.order_url(&created.id));
        Ok(ProvisionedOrder { order_id: created.id, order_url })
    }

    async fn update_order(&self, order_id: &str, payload: &OrderPayload) -> Result<(), GatewayError> {
        let request = self
            .authorized(self.rest.client.put(self.order_url(order_id)))
            .json(payload);
        self.rest.send("accounting.update_order", request).await.map(|_| ())
    }
}

/// Posts `{ "text": ... }` to an incoming chat webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    timeout_secs: u64,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self, reqwest::Error> {
        Ok(Self { client: build_client(timeout_secs)?, url: url.into(), timeout_secs })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|error| classify("chat.send", error, self.timeout_secs))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("chat.send", status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use fleetsync_core::config::AppConfig;
    use fleetsync_core::domain::outbox::ErrorClass;

    use super::{join_url, status_error, HttpAccountingGateway};
    use crate::ports::GatewayError;

    #[test]
    fn urls_join_without_doubled_slashes() {
        assert_eq!(join_url("https://crm.example/api/", "/leads/7"), "https://crm.example/api/leads/7");
        assert_eq!(join_url("https://crm.example", "leads"), "https://crm.example/leads");
    }

    #[test]
    fn status_errors_keep_the_retry_class_of_the_code() {
        assert_eq!(status_error("crm.get_lead", 429, "slow down").class(), ErrorClass::Transient);
        assert_eq!(status_error("crm.get_lead", 502, "").class(), ErrorClass::Transient);
        assert_eq!(status_error("crm.get_lead", 422, "bad field").class(), ErrorClass::Permanent);
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "é".repeat(600);
        let GatewayError::Status { body, status, .. } =
            status_error("accounting.create_order", 400, &body)
        else {
            panic!("expected a status error");
        };
        assert_eq!(status, 400);
        assert!(body.len() <= 512);
        assert!(body.chars().all(|ch| ch == 'é'));
    }

    #[test]
    fn order_url_falls_back_to_the_sales_order_path() {
        let mut config = AppConfig::default();
        config.accounting.base_url = "https://acc.example/api/".to_string();
        let gateway = HttpAccountingGateway::new(&config.accounting).expect("client");
        assert_eq!(gateway.order_url("SO-9"), "https://acc.example/api/sales-orders/SO-9");
    }
}

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetsync_core::domain::client::{Client, ClientId};

use super::{parse_timestamp, timestamp, ClientRepository, RepositoryError};
use crate::DbPool;

const CLIENT_COLUMNS: &str = "id, external_ref, name, email, phone, document_type, document_number,
    address, accounting_customer_id, created_at, updated_at";

pub struct SqlClientRepository {
    pool: DbPool,
}

impl SqlClientRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn write(&self, client: &Client, conflict_clause: &str) -> Result<(), RepositoryError> {
        let sql = format!(
            "INSERT INTO client ({CLIENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             {conflict_clause} DO UPDATE SET
                name = excluded.name,
                email = COALESCE(excluded.email, client.email),
                phone = COALESCE(excluded.phone, client.phone),
                document_type = COALESCE(excluded.document_type, client.document_type),
                document_number = COALESCE(excluded.document_number, client.document_number),
                address = COALESCE(excluded.address, client.address),
                accounting_customer_id =
                    COALESCE(excluded.accounting_customer_id, client.accounting_customer_id),
                updated_at = excluded.updated_at"
        );

        sqlx::query(&sql)
            .bind(&client.id.0)
            .bind(client.external_ref.as_deref())
            .bind(&client.name)
            .bind(client.email.as_deref())
            .bind(client.phone.as_deref())
            .bind(client.document_type.as_deref())
            .bind(client.document_number.as_deref())
            .bind(client.address.as_deref())
            .bind(client.accounting_customer_id.as_deref())
            .bind(timestamp(client.created_at))
            .bind(timestamp(client.updated_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ClientRepository for SqlClientRepository {
    async fn find_by_id(&self, id: &ClientId) -> Result<Option<Client>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CLIENT_COLUMNS} FROM client WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(client_from_row).transpose()
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Client>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {CLIENT_COLUMNS} FROM client WHERE external_ref = ?"))
                .bind(external_ref)
                .fetch_optional(&self.pool)
                .await?;

        row.map(client_from_row).transpose()
    }

    async fn upsert_by_external_ref(&self, client: &Client) -> Result<Client, RepositoryError> {
        let Some(external_ref) = client.external_ref.as_deref() else {
            self.save(client).await?;
            return Ok(client.clone());
        };

        self.write(client, "ON CONFLICT(external_ref)").await?;
        self.find_by_external_ref(external_ref).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("client `{external_ref}` vanished after upsert"))
        })
    }

    async fn save(&self, client: &Client) -> Result<(), RepositoryError> {
        self.write(client, "ON CONFLICT(id)").await
    }

    async fn set_accounting_customer_id(
        &self,
        id: &ClientId,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE client SET accounting_customer_id = ?, updated_at = ? WHERE id = ?")
            .bind(customer_id)
            .bind(timestamp(now))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn client_from_row(row: SqliteRow) -> Result<Client, RepositoryError> {
    Ok(Client {
        id: ClientId(row.try_get("id")?),
        external_ref: row.try_get("external_ref")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        document_type: row.try_get("document_type")?,
        document_number: row.try_get("document_number")?,
        address: row.try_get("address")?,
        accounting_customer_id: row.try_get("accounting_customer_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use fleetsync_core::domain::client::{Client, ClientId};

    use super::SqlClientRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::ClientRepository;

    fn contact(id: &str, external_ref: &str, email: Option<&str>) -> Client {
        Client {
            id: ClientId(id.to_string()),
            external_ref: Some(external_ref.to_string()),
            name: "Ana Petrovic".to_string(),
            email: email.map(str::to_string),
            phone: None,
            document_type: Some("passport".to_string()),
            document_number: Some("P1234567".to_string()),
            address: None,
            accounting_customer_id: None,
            created_at: parse_ts("2026-03-01T08:00:00Z"),
            updated_at: parse_ts("2026-03-01T08:00:00Z"),
        }
    }

    #[tokio::test]
    async fn upsert_by_external_ref_keeps_original_id_and_known_fields() {
        let repo = SqlClientRepository::new(setup_pool().await);

        let first = repo
            .upsert_by_external_ref(&contact("C-1", "CT-9", Some("ana@example.com")))
            .await
            .expect("first upsert");
        let second =
            repo.upsert_by_external_ref(&contact("C-2", "CT-9", None)).await.expect("second upsert");

        assert_eq!(first.id.0, "C-1");
        assert_eq!(second.id.0, "C-1");
        assert_eq!(second.email.as_deref(), Some("ana@example.com"));
    }

    #[tokio::test]
    async fn accounting_link_survives_later_contact_updates() {
        let repo = SqlClientRepository::new(setup_pool().await);
        let client = contact("C-1", "CT-9", Some("ana@example.com"));
        repo.save(&client).await.expect("save");

        repo.set_accounting_customer_id(&client.id, "ACC-77", parse_ts("2026-03-01T09:00:00Z"))
            .await
            .expect("link");
        repo.upsert_by_external_ref(&client).await.expect("refresh from crm");

        let stored = repo.find_by_id(&client.id).await.expect("find").expect("exists");
        assert_eq!(stored.accounting_customer_id.as_deref(), Some("ACC-77"));
    }
}

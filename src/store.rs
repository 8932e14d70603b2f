use crate::error::Result;
use crate::models::{Organization, Priority, Role, Ticket, TicketMessage, TicketStatus, User};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// SQLite-backed record store. All writes are immediately visible to
/// subsequent reads; callers treat every round-trip as a suspension
/// point with no ordering guarantee beyond the store's own transactions.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

/// Insert payloads keep the "absent vs explicitly empty" distinction of
/// the row types; the store fills in ids and timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub organization_id: i64,
    pub telegram_id: Option<i64>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub role: Role,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub organization_id: i64,
    pub customer_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub telegram_chat_id: Option<i64>,
    pub telegram_message_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub ticket_id: i64,
    pub user_id: Option<i64>,
    pub content: String,
    pub telegram_message_id: Option<i64>,
    pub is_from_customer: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CalendarToken {
    pub organization_id: i64,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Store {
    /// Open (and create if missing) the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every
    /// query on the same memory instance.
    #[cfg(test)]
    pub(crate) async fn memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Self { pool };
        store.init().await.unwrap();
        store
    }

    /// Create the schema if it does not exist yet.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                telegram_chat_id INTEGER,
                google_calendar_id TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL REFERENCES organizations(id),
                telegram_id INTEGER UNIQUE,
                username TEXT,
                email TEXT UNIQUE,
                password_hash TEXT,
                role TEXT NOT NULL,
                full_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL REFERENCES organizations(id),
                customer_id INTEGER REFERENCES users(id),
                assigned_agent_id INTEGER REFERENCES users(id),
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                priority TEXT NOT NULL DEFAULT 'medium',
                telegram_chat_id INTEGER,
                telegram_message_id INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_correlation
                ON tickets(telegram_chat_id, telegram_message_id);
            CREATE INDEX IF NOT EXISTS idx_tickets_org_status
                ON tickets(organization_id, status);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                ticket_id INTEGER NOT NULL REFERENCES tickets(id),
                user_id INTEGER REFERENCES users(id),
                content TEXT NOT NULL,
                telegram_message_id INTEGER,
                is_from_customer INTEGER NOT NULL,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_ticket
                ON messages(ticket_id, created_at);

            CREATE TABLE IF NOT EXISTS calendar_tokens (
                organization_id INTEGER PRIMARY KEY REFERENCES organizations(id),
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT,
                expiry DATETIME,
                updated_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- organizations ---

    /// Insert the organization with a fixed id if it is not there yet.
    /// Used at startup to guarantee the first-contact organization exists.
    pub async fn ensure_organization(&self, id: i64, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO organizations (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn organization_by_id(&self, id: i64) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(org)
    }

    // --- users ---

    pub async fn create_user(&self, new: &NewUser) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users
                (organization_id, telegram_id, username, email, password_hash,
                 role, full_name, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            RETURNING *
            "#,
        )
        .bind(new.organization_id)
        .bind(new.telegram_id)
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(new.role)
        .bind(&new.full_name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Active users of an organization, newest first.
    pub async fn users_by_organization(&self, org_id: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE organization_id = ? AND is_active = 1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    pub async fn count_users(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // --- tickets ---

    pub async fn create_ticket(&self, new: &NewTicket) -> Result<Ticket> {
        let now = Utc::now();
        let ticket = sqlx::query_as::<_, Ticket>(
            r#"
            INSERT INTO tickets
                (organization_id, customer_id, title, description, status,
                 priority, telegram_chat_id, telegram_message_id,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, 'open', ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.organization_id)
        .bind(new.customer_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.priority)
        .bind(new.telegram_chat_id)
        .bind(new.telegram_message_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(ticket)
    }

    pub async fn ticket_by_id(&self, id: i64) -> Result<Option<Ticket>> {
        let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ticket)
    }

    /// Indexed lookup of a ticket by its outbound correlation pair,
    /// scoped to one organization. If several tickets somehow carry the
    /// same pair, the most recently created one wins.
    pub async fn ticket_by_correlation(
        &self,
        org_id: i64,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<Ticket>> {
        let ticket = sqlx::query_as::<_, Ticket>(
            r#"
            SELECT * FROM tickets
            WHERE organization_id = ?
              AND telegram_chat_id = ?
              AND telegram_message_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ticket)
    }

    pub async fn tickets_by_organization(
        &self,
        org_id: i64,
        status: Option<TicketStatus>,
    ) -> Result<Vec<Ticket>> {
        let tickets = match status {
            Some(status) => {
                sqlx::query_as::<_, Ticket>(
                    r#"
                    SELECT * FROM tickets
                    WHERE organization_id = ? AND status = ?
                    ORDER BY created_at DESC, id DESC
                    "#,
                )
                .bind(org_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Ticket>(
                    r#"
                    SELECT * FROM tickets
                    WHERE organization_id = ?
                    ORDER BY created_at DESC, id DESC
                    "#,
                )
                .bind(org_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(tickets)
    }

    /// Conditional status update keyed by the expected current status.
    /// Returns false when zero rows changed, i.e. a concurrent
    /// transition got there first.
    pub async fn set_ticket_status(
        &self,
        id: i64,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tickets SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to)
                .bind(Utc::now())
                .bind(id)
                .bind(from)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Assign an agent and activate the ticket in one conditional write.
    /// The status guard keeps racing assigns consistent: the loser still
    /// matches `in_progress` and simply overwrites the agent.
    pub async fn assign_ticket(&self, id: i64, agent_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET assigned_agent_id = ?, status = 'in_progress', updated_at = ?
            WHERE id = ? AND status IN ('open', 'in_progress')
            "#,
        )
        .bind(agent_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the correlation pair of the latest outbound send for the
    /// ticket, so a future reply to that message routes back to it.
    pub async fn set_ticket_correlation(
        &self,
        id: i64,
        chat_id: i64,
        message_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tickets
            SET telegram_chat_id = ?, telegram_message_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(chat_id)
        .bind(message_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- messages ---

    pub async fn create_message(&self, new: &NewMessage) -> Result<TicketMessage> {
        let message = sqlx::query_as::<_, TicketMessage>(
            r#"
            INSERT INTO messages
                (ticket_id, user_id, content, telegram_message_id,
                 is_from_customer, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.ticket_id)
        .bind(new.user_id)
        .bind(&new.content)
        .bind(new.telegram_message_id)
        .bind(new.is_from_customer)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(message)
    }

    /// Timeline of a ticket, oldest first.
    pub async fn messages_by_ticket(&self, ticket_id: i64) -> Result<Vec<TicketMessage>> {
        let messages = sqlx::query_as::<_, TicketMessage>(
            r#"
            SELECT * FROM messages
            WHERE ticket_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn count_messages(&self, ticket_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE ticket_id = ?")
            .bind(ticket_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // --- calendar tokens ---

    pub async fn save_calendar_token(&self, token: &CalendarToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calendar_tokens
                (organization_id, access_token, refresh_token, token_type,
                 expiry, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(organization_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, refresh_token),
                token_type = excluded.token_type,
                expiry = excluded.expiry,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(token.organization_id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(&token.token_type)
        .bind(token.expiry)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn calendar_token(&self, org_id: i64) -> Result<Option<CalendarToken>> {
        let token = sqlx::query_as::<_, CalendarToken>(
            "SELECT organization_id, access_token, refresh_token, token_type, expiry
             FROM calendar_tokens WHERE organization_id = ?",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> Store {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();
        store
    }

    fn customer(telegram_id: i64) -> NewUser {
        NewUser {
            organization_id: 1,
            telegram_id: Some(telegram_id),
            username: None,
            email: None,
            password_hash: None,
            role: Role::Customer,
            full_name: Some("Test Customer".into()),
        }
    }

    #[tokio::test]
    async fn telegram_identity_is_unique() {
        let store = seeded().await;
        store.create_user(&customer(555)).await.unwrap();

        let err = store.create_user(&customer(555)).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn correlation_lookup_prefers_latest_ticket() {
        let store = seeded().await;
        let user = store.create_user(&customer(555)).await.unwrap();

        let mut ids = Vec::new();
        for title in ["first", "second"] {
            let ticket = store
                .create_ticket(&NewTicket {
                    organization_id: 1,
                    customer_id: Some(user.id),
                    title: title.into(),
                    description: None,
                    priority: Priority::default(),
                    telegram_chat_id: None,
                    telegram_message_id: None,
                })
                .await
                .unwrap();
            store
                .set_ticket_correlation(ticket.id, 555, 9001)
                .await
                .unwrap();
            ids.push(ticket.id);
        }

        let found = store
            .ticket_by_correlation(1, 555, 9001)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, ids[1]);
    }

    #[tokio::test]
    async fn correlation_lookup_is_scoped_to_organization() {
        let store = seeded().await;
        store.ensure_organization(2, "Globex").await.unwrap();
        let user = store.create_user(&customer(555)).await.unwrap();

        let ticket = store
            .create_ticket(&NewTicket {
                organization_id: 1,
                customer_id: Some(user.id),
                title: "printer broken".into(),
                description: None,
                priority: Priority::default(),
                telegram_chat_id: None,
                telegram_message_id: None,
            })
            .await
            .unwrap();
        store
            .set_ticket_correlation(ticket.id, 555, 9001)
            .await
            .unwrap();

        assert!(store
            .ticket_by_correlation(2, 555, 9001)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn messages_are_ordered_by_creation() {
        let store = seeded().await;
        let user = store.create_user(&customer(555)).await.unwrap();
        let ticket = store
            .create_ticket(&NewTicket {
                organization_id: 1,
                customer_id: Some(user.id),
                title: "printer broken".into(),
                description: None,
                priority: Priority::default(),
                telegram_chat_id: Some(555),
                telegram_message_id: None,
            })
            .await
            .unwrap();

        for content in ["one", "two", "three"] {
            store
                .create_message(&NewMessage {
                    ticket_id: ticket.id,
                    user_id: Some(user.id),
                    content: content.into(),
                    telegram_message_id: None,
                    is_from_customer: true,
                })
                .await
                .unwrap();
        }

        let messages = store.messages_by_ticket(ticket.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three"]);
    }
}

use std::{borrow::Cow, fmt::Display};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use overlay_alerts_core::{
    normalizer::DonationRef,
    types::{
        Donation, DonationLevel, DonationStatus, DomainError, Provider, SecuritySettings,
        SecurityViolation, StreamerProfile, VisualConfig, VisualOverrides, WebhookEvent,
        WebhookStatus,
    },
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, 5).await
    }

    /// Same as [`Database::connect`] with an explicit pool size.
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction spanning several repositories.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle to the webhook event idempotency store.
    pub fn webhook_events(&self) -> WebhookEventRepository {
        WebhookEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for donation records.
    pub fn donations(&self) -> DonationRepository {
        DonationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for streamer profiles, security settings and donation levels.
    pub fn streamers(&self) -> StreamerRepository {
        StreamerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the per-streamer security violation log.
    pub fn violations(&self) -> ViolationRepository {
        ViolationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code() == Some(Cow::Borrowed("2067")),
        _ => false,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code() == Some(Cow::Borrowed("787")),
        _ => false,
    }
}

fn corrupt(err: impl Display) -> String {
    err.to_string()
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

/// Repository responsible for the `webhook_events` table.
#[derive(Clone)]
pub struct WebhookEventRepository {
    pool: SqlitePool,
}

/// Data required to record a webhook on first receipt.
#[derive(Clone)]
pub struct NewWebhookEvent<'a> {
    pub event_id: &'a str,
    pub provider: Provider,
    pub event_type: &'a str,
    pub raw_payload: &'a str,
    pub signature: &'a str,
    pub signature_valid: bool,
    pub max_retries: u32,
    pub received_at: DateTime<Utc>,
}

/// Result of recording a webhook receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    Inserted(WebhookEvent),
    /// The event id was already known; the stored row is returned untouched.
    Duplicate(WebhookEvent),
}

impl ReceiptOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn event(&self) -> &WebhookEvent {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) => event,
        }
    }
}

/// Fields written when an event finishes successfully.
pub struct CompletedWebhook<'a> {
    pub processed_data: &'a Value,
    pub related_donation_id: Option<&'a str>,
    pub processing_time_ms: i64,
    pub completed_at: DateTime<Utc>,
}

/// Error type for operations on the `webhook_events` repository.
#[derive(Debug, Error)]
pub enum WebhookEventError {
    #[error("webhook event not found")]
    NotFound,
    #[error("webhook event {0} is not being processed")]
    NotProcessing(String),
    #[error("corrupt webhook event row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DomainError> for WebhookEventError {
    fn from(err: DomainError) -> Self {
        Self::Corrupt(corrupt(err))
    }
}

const WEBHOOK_COLUMNS: &str = "event_id, provider, event_type, status, raw_payload, processed_data, \
     signature, signature_valid, retry_count, max_retries, next_retry_at, processing_time_ms, \
     related_donation_id, error_message, received_at, updated_at";

impl WebhookEventRepository {
    /// Inserts the receipt, or returns the existing row when the event id is already stored.
    pub async fn record_receipt(
        &self,
        record: NewWebhookEvent<'_>,
    ) -> Result<ReceiptOutcome, WebhookEventError> {
        let received_at = to_rfc3339(record.received_at);
        let result = sqlx::query(
            "INSERT INTO webhook_events \
             (event_id, provider, event_type, status, raw_payload, signature, signature_valid, \
              retry_count, max_retries, received_at, updated_at) \
             VALUES (?, ?, ?, 'received', ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(record.event_id)
        .bind(record.provider.as_str())
        .bind(record.event_type)
        .bind(record.raw_payload)
        .bind(record.signature)
        .bind(record.signature_valid)
        .bind(i64::from(record.max_retries))
        .bind(&received_at)
        .bind(&received_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                let event = self
                    .fetch(record.event_id)
                    .await?
                    .ok_or(WebhookEventError::NotFound)?;
                Ok(ReceiptOutcome::Inserted(event))
            }
            Err(err) if is_unique_violation(&err) => {
                let event = self
                    .fetch(record.event_id)
                    .await?
                    .ok_or(WebhookEventError::NotFound)?;
                Ok(ReceiptOutcome::Duplicate(event))
            }
            Err(err) => Err(WebhookEventError::Database(err)),
        }
    }

    pub async fn fetch(&self, event_id: &str) -> Result<Option<WebhookEvent>, WebhookEventError> {
        let row = sqlx::query_as::<_, WebhookEventRow>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE event_id = ?"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEventRow::into_domain).transpose()
    }

    /// Compare-and-set `received -> processing`. Returns `false` when another worker owns the
    /// event or it is already terminal.
    pub async fn claim(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, WebhookEventError> {
        let result = sqlx::query(
            "UPDATE webhook_events SET status = 'processing', updated_at = ? \
             WHERE event_id = ? AND status = 'received'",
        )
        .bind(to_rfc3339(now))
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a claimed event completed inside the caller's transaction.
    pub async fn complete(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event_id: &str,
        completed: CompletedWebhook<'_>,
    ) -> Result<(), WebhookEventError> {
        let processed = serde_json::to_string(completed.processed_data)
            .map_err(|err| WebhookEventError::Corrupt(corrupt(err)))?;
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = 'completed', processed_data = ?, related_donation_id = ?, \
                 processing_time_ms = ?, next_retry_at = NULL, error_message = NULL, updated_at = ? \
             WHERE event_id = ? AND status = 'processing'",
        )
        .bind(processed)
        .bind(completed.related_donation_id)
        .bind(completed.processing_time_ms)
        .bind(to_rfc3339(completed.completed_at))
        .bind(event_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookEventError::NotProcessing(event_id.to_string()));
        }
        Ok(())
    }

    /// Returns the event to `received` so the retry sweep picks it up at `next_retry_at`.
    pub async fn schedule_retry(
        &self,
        event_id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookEventError> {
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = 'received', retry_count = ?, next_retry_at = ?, error_message = ?, \
                 updated_at = ? \
             WHERE event_id = ? AND status IN ('received', 'processing')",
        )
        .bind(i64::from(retry_count))
        .bind(to_rfc3339(next_retry_at))
        .bind(error_message)
        .bind(to_rfc3339(now))
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookEventError::NotFound);
        }
        Ok(())
    }

    /// Terminal failure. Completed events are never downgraded.
    pub async fn mark_failed(
        &self,
        event_id: &str,
        retry_count: Option<u32>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookEventError> {
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = 'failed', retry_count = COALESCE(?, retry_count), next_retry_at = NULL, \
                 error_message = ?, updated_at = ? \
             WHERE event_id = ? AND status != 'completed'",
        )
        .bind(retry_count.map(i64::from))
        .bind(error_message)
        .bind(to_rfc3339(now))
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookEventError::NotFound);
        }
        Ok(())
    }

    /// Events waiting for a retry whose `next_retry_at` has passed, oldest first.
    pub async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, WebhookEventError> {
        let rows = sqlx::query_as::<_, WebhookEventRow>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events \
             WHERE status = 'received' AND next_retry_at IS NOT NULL AND next_retry_at <= ? \
             ORDER BY next_retry_at ASC, received_at ASC LIMIT ?"
        ))
        .bind(to_rfc3339(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEventRow::into_domain).collect()
    }

    /// Makes abandoned events due again: claims stuck in `processing`, and receipts that were
    /// recorded but never picked up (no `next_retry_at`), both untouched since `older_than`.
    pub async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, WebhookEventError> {
        let cutoff = to_rfc3339(older_than);
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = 'received', next_retry_at = ?, updated_at = ? \
             WHERE (status = 'processing' AND updated_at <= ?) \
                OR (status = 'received' AND next_retry_at IS NULL AND updated_at <= ?)",
        )
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .bind(&cutoff)
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    event_id: String,
    provider: String,
    event_type: String,
    status: String,
    raw_payload: String,
    processed_data: Option<String>,
    signature: String,
    signature_valid: bool,
    retry_count: i64,
    max_retries: i64,
    next_retry_at: Option<DateTime<Utc>>,
    processing_time_ms: Option<i64>,
    related_donation_id: Option<String>,
    error_message: Option<String>,
    received_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WebhookEventRow {
    fn into_domain(self) -> Result<WebhookEvent, WebhookEventError> {
        let processed_data = self
            .processed_data
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|err| WebhookEventError::Corrupt(corrupt(err)))?;

        Ok(WebhookEvent {
            event_id: self.event_id,
            provider: self.provider.parse()?,
            event_type: self.event_type,
            status: self.status.parse::<WebhookStatus>()?,
            raw_payload: self.raw_payload,
            processed_data,
            signature: self.signature,
            signature_valid: self.signature_valid,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            next_retry_at: self.next_retry_at,
            processing_time_ms: self.processing_time_ms,
            related_donation_id: self.related_donation_id,
            error_message: self.error_message,
            received_at: self.received_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Donations
// ---------------------------------------------------------------------------

/// Repository for the `donations` table.
#[derive(Clone)]
pub struct DonationRepository {
    pool: SqlitePool,
}

/// Errors that can occur while reading or mutating donations.
#[derive(Debug, Error)]
pub enum DonationError {
    #[error("donation with the same id or transaction id already exists")]
    Duplicate,
    #[error("streamer is missing for donation")]
    MissingStreamer,
    #[error("corrupt donation row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DomainError> for DonationError {
    fn from(err: DomainError) -> Self {
        Self::Corrupt(corrupt(err))
    }
}

const DONATION_COLUMNS: &str = "id, donor_id, donor_name, streamer_id, amount, currency, message, \
     status, payment_method, transaction_id, is_anonymous, created_at, updated_at, completed_at, \
     failed_at";

impl DonationRepository {
    pub async fn insert(&self, donation: &Donation) -> Result<(), DonationError> {
        sqlx::query(&format!(
            "INSERT INTO donations ({DONATION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&donation.id)
        .bind(&donation.donor_id)
        .bind(&donation.donor_name)
        .bind(&donation.streamer_id)
        .bind(donation.amount)
        .bind(donation.currency.as_str())
        .bind(&donation.message)
        .bind(donation.status.as_str())
        .bind(donation.payment_method.as_str())
        .bind(&donation.transaction_id)
        .bind(donation.is_anonymous)
        .bind(to_rfc3339(donation.created_at))
        .bind(to_rfc3339(donation.updated_at))
        .bind(donation.completed_at.map(to_rfc3339))
        .bind(donation.failed_at.map(to_rfc3339))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                DonationError::Duplicate
            } else if is_foreign_key_violation(&err) {
                DonationError::MissingStreamer
            } else {
                DonationError::Database(err)
            }
        })?;

        Ok(())
    }

    pub async fn fetch(&self, donation_id: &str) -> Result<Option<Donation>, DonationError> {
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?"
        ))
        .bind(donation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DonationRow::into_domain).transpose()
    }

    /// Looks up the donation a webhook refers to, inside the reconciliation transaction.
    pub async fn find_by_reference(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        reference: &DonationRef,
    ) -> Result<Option<Donation>, DonationError> {
        let column = match reference {
            DonationRef::DonationId(_) => "id",
            DonationRef::TransactionId(_) => "transaction_id",
        };
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE {column} = ?"
        ))
        .bind(reference.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(DonationRow::into_domain).transpose()
    }

    /// Persists a status change only if the stored status still equals `expected`.
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        donation: &Donation,
        expected: DonationStatus,
    ) -> Result<bool, DonationError> {
        let result = sqlx::query(
            "UPDATE donations \
             SET status = ?, updated_at = ?, completed_at = ?, failed_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(donation.status.as_str())
        .bind(to_rfc3339(donation.updated_at))
        .bind(donation.completed_at.map(to_rfc3339))
        .bind(donation.failed_at.map(to_rfc3339))
        .bind(&donation.id)
        .bind(expected.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DonationRow {
    id: String,
    donor_id: Option<String>,
    donor_name: Option<String>,
    streamer_id: String,
    amount: i64,
    currency: String,
    message: Option<String>,
    status: String,
    payment_method: String,
    transaction_id: Option<String>,
    is_anonymous: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl DonationRow {
    fn into_domain(self) -> Result<Donation, DonationError> {
        Ok(Donation {
            id: self.id,
            donor_id: self.donor_id,
            donor_name: self.donor_name,
            streamer_id: self.streamer_id,
            amount: self.amount,
            currency: self.currency.parse()?,
            message: self.message,
            status: self.status.parse()?,
            payment_method: self.payment_method.parse()?,
            transaction_id: self.transaction_id,
            is_anonymous: self.is_anonymous,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Streamers, security settings and donation levels
// ---------------------------------------------------------------------------

/// Repository for streamer profiles and their embedded configuration.
#[derive(Clone)]
pub struct StreamerRepository {
    pool: SqlitePool,
}

/// Errors that can occur while reading or mutating streamer records.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("streamer not found")]
    NotFound,
    #[error("streamer id or alert token already in use")]
    Duplicate,
    #[error("failed to decode stored json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("corrupt streamer row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DomainError> for StreamerError {
    fn from(err: DomainError) -> Self {
        Self::Corrupt(corrupt(err))
    }
}

const STREAMER_COLUMNS: &str = "id, display_name, alert_token, is_token_revoked, allowed_ips_json, \
     max_connections, require_ip_validation, require_request_signing, request_signature_secret, \
     default_alert_json";

impl StreamerRepository {
    pub async fn insert(
        &self,
        profile: &StreamerProfile,
        now: DateTime<Utc>,
    ) -> Result<(), StreamerError> {
        let security = &profile.security;
        let created_at = to_rfc3339(now);
        sqlx::query(&format!(
            "INSERT INTO streamers ({STREAMER_COLUMNS}, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&profile.streamer_id)
        .bind(&profile.display_name)
        .bind(&security.alert_token)
        .bind(security.is_token_revoked)
        .bind(serde_json::to_string(&security.allowed_ips)?)
        .bind(i64::from(security.max_connections))
        .bind(security.require_ip_validation)
        .bind(security.require_request_signing)
        .bind(&security.request_signature_secret)
        .bind(serde_json::to_string(&profile.default_alert)?)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StreamerError::Duplicate
            } else {
                StreamerError::Database(err)
            }
        })?;

        Ok(())
    }

    pub async fn fetch(&self, streamer_id: &str) -> Result<StreamerProfile, StreamerError> {
        let row = sqlx::query_as::<_, StreamerRow>(&format!(
            "SELECT {STREAMER_COLUMNS} FROM streamers WHERE id = ?"
        ))
        .bind(streamer_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StreamerError::NotFound)?;

        row.into_domain()
    }

    /// Resolves the streamer owning `alert_token`, revoked or not.
    pub async fn fetch_by_token(
        &self,
        alert_token: &str,
    ) -> Result<Option<StreamerProfile>, StreamerError> {
        let row = sqlx::query_as::<_, StreamerRow>(&format!(
            "SELECT {STREAMER_COLUMNS} FROM streamers WHERE alert_token = ?"
        ))
        .bind(alert_token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StreamerRow::into_domain).transpose()
    }

    /// Overwrites the security settings. The alert token itself is only changed through
    /// [`StreamerRepository::rotate_token`].
    pub async fn save_security(
        &self,
        streamer_id: &str,
        settings: &SecuritySettings,
        now: DateTime<Utc>,
    ) -> Result<(), StreamerError> {
        let result = sqlx::query(
            "UPDATE streamers \
             SET allowed_ips_json = ?, max_connections = ?, require_ip_validation = ?, \
                 require_request_signing = ?, request_signature_secret = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(serde_json::to_string(&settings.allowed_ips)?)
        .bind(i64::from(settings.max_connections))
        .bind(settings.require_ip_validation)
        .bind(settings.require_request_signing)
        .bind(&settings.request_signature_secret)
        .bind(to_rfc3339(now))
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StreamerError::NotFound);
        }
        Ok(())
    }

    pub async fn revoke_token(
        &self,
        streamer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StreamerError> {
        let result = sqlx::query(
            "UPDATE streamers SET is_token_revoked = 1, updated_at = ? WHERE id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StreamerError::NotFound);
        }
        Ok(())
    }

    /// Replaces the alert token and clears the revocation flag.
    pub async fn rotate_token(
        &self,
        streamer_id: &str,
        alert_token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StreamerError> {
        let result = sqlx::query(
            "UPDATE streamers SET alert_token = ?, is_token_revoked = 0, updated_at = ? WHERE id = ?",
        )
        .bind(alert_token)
        .bind(to_rfc3339(now))
        .bind(streamer_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StreamerError::Duplicate
            } else {
                StreamerError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(StreamerError::NotFound);
        }
        Ok(())
    }

    pub async fn update_default_alert(
        &self,
        streamer_id: &str,
        config: &VisualConfig,
        now: DateTime<Utc>,
    ) -> Result<(), StreamerError> {
        let result = sqlx::query(
            "UPDATE streamers SET default_alert_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(config)?)
        .bind(to_rfc3339(now))
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StreamerError::NotFound);
        }
        Ok(())
    }

    pub async fn upsert_level(&self, level: &DonationLevel) -> Result<(), StreamerError> {
        sqlx::query(
            "INSERT INTO donation_levels \
             (level_id, streamer_id, min_amount, max_amount, currency, is_enabled, configuration_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(level_id) DO UPDATE SET \
               min_amount = excluded.min_amount, max_amount = excluded.max_amount, \
               currency = excluded.currency, is_enabled = excluded.is_enabled, \
               configuration_json = excluded.configuration_json",
        )
        .bind(&level.level_id)
        .bind(&level.streamer_id)
        .bind(level.min_amount)
        .bind(level.max_amount)
        .bind(level.currency.as_str())
        .bind(level.is_enabled)
        .bind(serde_json::to_string(&level.configuration)?)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StreamerError::NotFound
            } else {
                StreamerError::Database(err)
            }
        })?;

        Ok(())
    }

    /// All levels of a streamer ordered by `min_amount`, then `level_id`.
    pub async fn list_levels(&self, streamer_id: &str) -> Result<Vec<DonationLevel>, StreamerError> {
        let rows = sqlx::query_as::<_, LevelRow>(
            "SELECT level_id, streamer_id, min_amount, max_amount, currency, is_enabled, configuration_json \
             FROM donation_levels WHERE streamer_id = ? ORDER BY min_amount ASC, level_id ASC",
        )
        .bind(streamer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LevelRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StreamerRow {
    id: String,
    display_name: String,
    alert_token: String,
    is_token_revoked: bool,
    allowed_ips_json: String,
    max_connections: i64,
    require_ip_validation: bool,
    require_request_signing: bool,
    request_signature_secret: Option<String>,
    default_alert_json: String,
}

impl StreamerRow {
    fn into_domain(self) -> Result<StreamerProfile, StreamerError> {
        Ok(StreamerProfile {
            streamer_id: self.id,
            display_name: self.display_name,
            security: SecuritySettings {
                alert_token: self.alert_token,
                is_token_revoked: self.is_token_revoked,
                allowed_ips: serde_json::from_str(&self.allowed_ips_json)?,
                max_connections: self.max_connections.max(0) as u32,
                require_ip_validation: self.require_ip_validation,
                require_request_signing: self.require_request_signing,
                request_signature_secret: self.request_signature_secret,
            },
            default_alert: serde_json::from_str(&self.default_alert_json)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LevelRow {
    level_id: String,
    streamer_id: String,
    min_amount: i64,
    max_amount: i64,
    currency: String,
    is_enabled: bool,
    configuration_json: String,
}

impl LevelRow {
    fn into_domain(self) -> Result<DonationLevel, StreamerError> {
        let configuration: VisualOverrides = serde_json::from_str(&self.configuration_json)?;
        let mut level = DonationLevel::new(
            self.level_id,
            self.streamer_id,
            self.min_amount,
            self.max_amount,
            self.currency.parse()?,
        )?
        .with_configuration(configuration);
        level.is_enabled = self.is_enabled;
        Ok(level)
    }
}

// ---------------------------------------------------------------------------
// Security violations
// ---------------------------------------------------------------------------

/// Repository for the bounded per-streamer violation log.
#[derive(Clone)]
pub struct ViolationRepository {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
pub enum ViolationError {
    #[error("streamer is missing for violation")]
    MissingStreamer,
    #[error("corrupt violation row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DomainError> for ViolationError {
    fn from(err: DomainError) -> Self {
        Self::Corrupt(corrupt(err))
    }
}

impl ViolationRepository {
    /// Appends an entry and trims the log to the newest `keep` entries.
    pub async fn append(
        &self,
        streamer_id: &str,
        violation: &SecurityViolation,
        keep: u32,
    ) -> Result<(), ViolationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO security_violations (streamer_id, kind, occurred_at, ip, user_agent, details) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(streamer_id)
        .bind(violation.kind.as_str())
        .bind(to_rfc3339(violation.timestamp))
        .bind(&violation.ip)
        .bind(&violation.user_agent)
        .bind(&violation.details)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                ViolationError::MissingStreamer
            } else {
                ViolationError::Database(err)
            }
        })?;

        sqlx::query(
            "DELETE FROM security_violations \
             WHERE streamer_id = ? AND id NOT IN ( \
               SELECT id FROM security_violations WHERE streamer_id = ? ORDER BY id DESC LIMIT ?)",
        )
        .bind(streamer_id)
        .bind(streamer_id)
        .bind(i64::from(keep))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent entries first.
    pub async fn list(
        &self,
        streamer_id: &str,
        limit: u32,
    ) -> Result<Vec<SecurityViolation>, ViolationError> {
        let rows = sqlx::query_as::<_, ViolationRow>(
            "SELECT kind, occurred_at, ip, user_agent, details FROM security_violations \
             WHERE streamer_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(streamer_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ViolationRow::into_domain).collect()
    }

    pub async fn count(&self, streamer_id: &str) -> Result<u64, ViolationError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM security_violations WHERE streamer_id = ?")
                .bind(streamer_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ViolationRow {
    kind: String,
    occurred_at: DateTime<Utc>,
    ip: Option<String>,
    user_agent: Option<String>,
    details: String,
}

impl ViolationRow {
    fn into_domain(self) -> Result<SecurityViolation, ViolationError> {
        Ok(SecurityViolation {
            kind: self.kind.parse()?,
            timestamp: self.occurred_at,
            ip: self.ip,
            user_agent: self.user_agent,
            details: self.details,
        })
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use overlay_alerts_core::types::{Currency, PaymentMethod, ViolationKind};
    use serde_json::json;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    async fn setup_db() -> Database {
        let db = Database::connect_with("sqlite::memory:", 1)
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db.streamers()
            .insert(&profile("s-1", &"t".repeat(40)), at(0))
            .await
            .expect("insert streamer");
        db
    }

    fn profile(id: &str, token: &str) -> StreamerProfile {
        StreamerProfile {
            streamer_id: id.to_string(),
            display_name: "Example".to_string(),
            security: SecuritySettings::with_token(token),
            default_alert: VisualConfig::default(),
        }
    }

    fn receipt(event_id: &str) -> NewWebhookEvent<'_> {
        NewWebhookEvent {
            event_id,
            provider: Provider::Stripe,
            event_type: "charge.succeeded",
            raw_payload: "{}",
            signature: "t=1,v1=00",
            signature_valid: true,
            max_retries: 3,
            received_at: at(0),
        }
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect_with("sqlite::memory:", 1)
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 5, "expected core tables to be created");
    }

    #[tokio::test]
    async fn duplicate_receipt_returns_existing_row() {
        let db = setup_db().await;
        let repo = db.webhook_events();

        let first = repo.record_receipt(receipt("evt-1")).await.expect("insert");
        assert!(!first.is_duplicate());
        assert_eq!(first.event().status, WebhookStatus::Received);

        let mut again = receipt("evt-1");
        again.signature_valid = false;
        let second = repo.record_receipt(again).await.expect("duplicate");
        assert!(second.is_duplicate());
        assert!(second.event().signature_valid, "existing row is untouched");

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_events")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.record_receipt(receipt("evt-2")).await.unwrap();

        assert!(repo.claim("evt-2", at(1)).await.unwrap());
        assert!(!repo.claim("evt-2", at(1)).await.unwrap());

        let mut tx = db.begin().await.unwrap();
        repo.complete(
            &mut tx,
            "evt-2",
            CompletedWebhook {
                processed_data: &json!({"transition": "completed"}),
                related_donation_id: Some("don-1"),
                processing_time_ms: 12,
                completed_at: at(2),
            },
        )
        .await
        .expect("complete");
        tx.commit().await.unwrap();

        let stored = repo.fetch("evt-2").await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Completed);
        assert_eq!(stored.related_donation_id.as_deref(), Some("don-1"));
        assert!(!repo.claim("evt-2", at(3)).await.unwrap());
        assert!(repo.mark_failed("evt-2", None, "late", at(3)).await.is_err());
    }

    #[tokio::test]
    async fn complete_requires_processing_state() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.record_receipt(receipt("evt-3")).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let err = repo
            .complete(
                &mut tx,
                "evt-3",
                CompletedWebhook {
                    processed_data: &json!({}),
                    related_donation_id: None,
                    processing_time_ms: 0,
                    completed_at: at(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookEventError::NotProcessing(_)));
    }

    #[tokio::test]
    async fn retries_become_due_after_next_retry_at() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.record_receipt(receipt("evt-4")).await.unwrap();
        assert!(repo.claim("evt-4", at(0)).await.unwrap());
        repo.schedule_retry("evt-4", 1, at(60), "donation not found", at(0))
            .await
            .unwrap();

        assert!(repo.list_due(at(59), 10).await.unwrap().is_empty());
        let due = repo.list_due(at(60), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
        assert_eq!(due[0].status, WebhookStatus::Received);
        assert_eq!(due[0].error_message.as_deref(), Some("donation not found"));

        repo.mark_failed("evt-4", Some(3), "retries exhausted", at(61))
            .await
            .unwrap();
        let failed = repo.fetch("evt-4").await.unwrap().unwrap();
        assert_eq!(failed.status, WebhookStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert!(failed.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn stale_processing_events_are_released() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.record_receipt(receipt("evt-5")).await.unwrap();
        assert!(repo.claim("evt-5", at(0)).await.unwrap());

        assert_eq!(repo.release_stale(at(-1), at(10)).await.unwrap(), 0);
        assert_eq!(repo.release_stale(at(5), at(10)).await.unwrap(), 1);
        assert_eq!(repo.list_due(at(10), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unclaimed_receipts_are_released_for_retry() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.record_receipt(receipt("evt-orphan")).await.unwrap();
        assert!(repo.list_due(at(86_400), 10).await.unwrap().is_empty());

        assert_eq!(repo.release_stale(at(-1), at(10)).await.unwrap(), 0);
        assert_eq!(repo.release_stale(at(300), at(400)).await.unwrap(), 1);
        let due = repo.list_due(at(400), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_id, "evt-orphan");
        assert_eq!(due[0].retry_count, 0);

        // Scheduled retries and terminal events are left alone.
        assert_eq!(repo.release_stale(at(400), at(500)).await.unwrap(), 0);
        assert!(repo.claim("evt-orphan", at(500)).await.unwrap());
        repo.mark_failed("evt-orphan", None, "permanent", at(500))
            .await
            .unwrap();
        assert_eq!(repo.release_stale(at(9_000), at(9_000)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn donation_lookup_by_reference_and_conditional_update() {
        let db = setup_db().await;
        let repo = db.donations();
        let mut donation = Donation::pending("s-1", 5_000, Currency::Krw, PaymentMethod::Card, at(0))
            .unwrap()
            .with_donor(None, "Alice")
            .with_transaction_id("ch_1");
        repo.insert(&donation).await.expect("insert donation");
        assert!(matches!(
            repo.insert(&donation).await,
            Err(DonationError::Duplicate)
        ));

        let mut tx = db.begin().await.unwrap();
        let by_tx = repo
            .find_by_reference(&mut tx, &DonationRef::TransactionId("ch_1".into()))
            .await
            .unwrap()
            .expect("found by transaction");
        assert_eq!(by_tx.id, donation.id);
        let by_id = repo
            .find_by_reference(&mut tx, &DonationRef::DonationId(donation.id.clone()))
            .await
            .unwrap();
        assert!(by_id.is_some());

        donation.apply(DonationStatus::Completed, at(5)).unwrap();
        assert!(repo
            .update_status(&mut tx, &donation, DonationStatus::Pending)
            .await
            .unwrap());
        assert!(!repo
            .update_status(&mut tx, &donation, DonationStatus::Pending)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let stored = repo.fetch(&donation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Completed);
        assert_eq!(stored.completed_at, Some(at(5)));
    }

    #[tokio::test]
    async fn donation_requires_known_streamer() {
        let db = setup_db().await;
        let donation =
            Donation::pending("missing", 100, Currency::Usd, PaymentMethod::Card, at(0)).unwrap();
        assert!(matches!(
            db.donations().insert(&donation).await,
            Err(DonationError::MissingStreamer)
        ));
    }

    #[tokio::test]
    async fn streamer_token_lifecycle() {
        let db = setup_db().await;
        let repo = db.streamers();
        let token = "t".repeat(40);

        let found = repo.fetch_by_token(&token).await.unwrap().expect("by token");
        assert_eq!(found.streamer_id, "s-1");
        assert!(!found.security.is_token_revoked);

        repo.revoke_token("s-1", at(1)).await.unwrap();
        assert!(repo.fetch("s-1").await.unwrap().security.is_token_revoked);

        let fresh = "f".repeat(64);
        repo.rotate_token("s-1", &fresh, at(2)).await.unwrap();
        let rotated = repo.fetch("s-1").await.unwrap();
        assert_eq!(rotated.security.alert_token, fresh);
        assert!(!rotated.security.is_token_revoked);
        assert!(repo.fetch_by_token(&token).await.unwrap().is_none());

        repo.insert(&profile("s-2", &"x".repeat(40)), at(3)).await.unwrap();
        assert!(matches!(
            repo.rotate_token("s-2", &fresh, at(4)).await,
            Err(StreamerError::Duplicate)
        ));
        assert!(matches!(
            repo.revoke_token("nobody", at(4)).await,
            Err(StreamerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn security_settings_round_trip() {
        let db = setup_db().await;
        let repo = db.streamers();
        let mut settings = repo.fetch("s-1").await.unwrap().security;
        settings.allowed_ips = vec!["10.0.0.0/8".into()];
        settings.require_ip_validation = true;
        settings.require_request_signing = true;
        settings.request_signature_secret = Some("sig-secret".into());
        settings.max_connections = 2;
        repo.save_security("s-1", &settings, at(1)).await.unwrap();

        let stored = repo.fetch("s-1").await.unwrap().security;
        assert_eq!(stored, settings);
    }

    #[tokio::test]
    async fn levels_are_listed_in_resolution_order() {
        let db = setup_db().await;
        let repo = db.streamers();
        repo.upsert_level(&DonationLevel::new("b", "s-1", 50_000, 100_000, Currency::Krw).unwrap())
            .await
            .unwrap();
        repo.upsert_level(&DonationLevel::new("a", "s-1", 0, 50_000, Currency::Krw).unwrap())
            .await
            .unwrap();
        repo.upsert_level(
            &DonationLevel::new("b", "s-1", 50_000, 200_000, Currency::Krw)
                .unwrap()
                .disabled(),
        )
        .await
        .unwrap();

        let levels = repo.list_levels("s-1").await.unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].level_id, "a");
        assert_eq!(levels[1].max_amount, 200_000);
        assert!(!levels[1].is_enabled);
        assert!(matches!(
            repo.upsert_level(&DonationLevel::new("z", "nobody", 0, 1, Currency::Krw).unwrap())
                .await,
            Err(StreamerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn violation_log_is_trimmed_to_most_recent() {
        let db = setup_db().await;
        let repo = db.violations();
        for i in 0..5 {
            repo.append(
                "s-1",
                &SecurityViolation {
                    kind: ViolationKind::RateLimitExceeded,
                    timestamp: at(i),
                    ip: Some("1.2.3.4".into()),
                    user_agent: None,
                    details: format!("attempt {i}"),
                },
                3,
            )
            .await
            .unwrap();
        }

        assert_eq!(repo.count("s-1").await.unwrap(), 3);
        let entries = repo.list("s-1", 10).await.unwrap();
        let details: Vec<_> = entries.iter().map(|v| v.details.as_str()).collect();
        assert_eq!(details, vec!["attempt 4", "attempt 3", "attempt 2"]);
    }

    #[tokio::test]
    async fn receipts_survive_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("alerts.db").display());
        {
            let db = Database::connect(&url).await.expect("connect");
            db.run_migrations().await.expect("migrations");
            db.streamers()
                .insert(&profile("s-1", &"t".repeat(40)), at(0))
                .await
                .unwrap();
            db.webhook_events()
                .record_receipt(receipt("evt-durable"))
                .await
                .unwrap();
            db.pool().close().await;
        }

        let db = Database::connect(&url).await.expect("reconnect");
        db.run_migrations().await.expect("migrations are idempotent");
        let stored = db.webhook_events().fetch("evt-durable").await.unwrap();
        assert!(stored.is_some());
        assert!(stored.unwrap().received_at + Duration::seconds(1) > at(0));
    }
}

use crate::models::{AppOpen, FingerprintedVisit, Install, Link, ShortUrl};
use crate::storage::{AttributionStore, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    /// Note that every connection to `sqlite::memory:` opens its own database, so in-memory
    /// stores should be created with a single connection.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[derive(sqlx::FromRow)]
struct VisitRow {
    fingerprint: String,
    context: String,
    short_code: String,
    deeplink: Option<String>,
    referrer: Option<String>,
    app_url_scheme: Option<String>,
    timestamp: i64,
}

impl VisitRow {
    fn into_visit(self) -> StorageResult<FingerprintedVisit> {
        Ok(FingerprintedVisit {
            fingerprint: serde_json::from_str(&self.fingerprint)?,
            context: self.context,
            short_code: self.short_code,
            deeplink: self.deeplink,
            referrer: self.referrer,
            app_url_scheme: self.app_url_scheme,
            timestamp: self.timestamp,
        })
    }
}

#[async_trait]
impl AttributionStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        // Short urls are stored as whole documents; rules are only ever read together
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS short_urls (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                created INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS installs (
                app_url_scheme TEXT NOT NULL,
                context TEXT NOT NULL,
                installed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (app_url_scheme, context)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS app_opens (
                app_url_scheme TEXT NOT NULL,
                context TEXT NOT NULL,
                app_context TEXT NOT NULL,
                source_context TEXT,
                source_application TEXT,
                short_code TEXT,
                deeplink TEXT,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (app_url_scheme, context)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                context1 TEXT NOT NULL,
                context2 TEXT NOT NULL,
                app_url_scheme TEXT NOT NULL,
                short_code TEXT,
                created INTEGER NOT NULL,
                PRIMARY KEY (context1, context2)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprinted_visits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL,
                context TEXT NOT NULL,
                short_code TEXT NOT NULL,
                deeplink TEXT,
                referrer TEXT,
                app_url_scheme TEXT,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_visits_timestamp ON fingerprinted_visits(timestamp)",
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_short_url(&self, code: &str) -> StorageResult<Option<ShortUrl>> {
        let document =
            sqlx::query_scalar::<_, String>("SELECT document FROM short_urls WHERE id = ?")
                .bind(code)
                .fetch_optional(self.pool.as_ref())
                .await?;

        match document {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_short_url(&self, url: &ShortUrl) -> StorageResult<()> {
        let document = serde_json::to_string(url)?;

        sqlx::query(
            r#"
            INSERT INTO short_urls (id, document, created)
            VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                document = excluded.document,
                created = excluded.created
            "#,
        )
        .bind(&url.id)
        .bind(document)
        .bind(url.created)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_install(&self, scheme: &str, context: &str) -> StorageResult<Option<Install>> {
        let install = sqlx::query_as::<_, Install>(
            r#"
            SELECT app_url_scheme, context, installed_at, expires_at
            FROM installs
            WHERE app_url_scheme = ? AND context = ?
            "#,
        )
        .bind(scheme)
        .bind(context)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(install)
    }

    async fn track_install(&self, install: &Install) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO installs (app_url_scheme, context, installed_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (app_url_scheme, context) DO UPDATE SET
                installed_at = excluded.installed_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&install.app_url_scheme)
        .bind(&install.context)
        .bind(install.installed_at)
        .bind(install.expires_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_app_open(
        &self,
        scheme: &str,
        context: &str,
    ) -> StorageResult<Option<AppOpen>> {
        let app_open = sqlx::query_as::<_, AppOpen>(
            r#"
            SELECT app_url_scheme, context, app_context, source_context, source_application,
                   short_code, deeplink, timestamp
            FROM app_opens
            WHERE app_url_scheme = ? AND context = ?
            "#,
        )
        .bind(scheme)
        .bind(context)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(app_open)
    }

    async fn track_app_open(&self, app_open: &AppOpen) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO app_opens (app_url_scheme, context, app_context, source_context,
                                   source_application, short_code, deeplink, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (app_url_scheme, context) DO UPDATE SET
                app_context = excluded.app_context,
                source_context = excluded.source_context,
                source_application = excluded.source_application,
                short_code = excluded.short_code,
                deeplink = excluded.deeplink,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(&app_open.app_url_scheme)
        .bind(&app_open.context)
        .bind(&app_open.app_context)
        .bind(&app_open.source_context)
        .bind(&app_open.source_application)
        .bind(&app_open.short_code)
        .bind(&app_open.deeplink)
        .bind(app_open.timestamp)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_link(&self, a: &str, b: &str) -> StorageResult<Option<Link>> {
        let (context1, context2) = Link::key(a, b);

        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT context1, context2, app_url_scheme, short_code, created
            FROM links
            WHERE context1 = ? AND context2 = ?
            "#,
        )
        .bind(context1)
        .bind(context2)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn link(&self, link: &Link) -> StorageResult<bool> {
        let (context1, context2) = Link::key(&link.context1, &link.context2);

        let result = sqlx::query(
            r#"
            INSERT INTO links (context1, context2, app_url_scheme, short_code, created)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (context1, context2) DO NOTHING
            "#,
        )
        .bind(context1)
        .bind(context2)
        .bind(&link.app_url_scheme)
        .bind(&link.short_code)
        .bind(link.created)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_fingerprinted_visit(&self, visit: &FingerprintedVisit) -> StorageResult<()> {
        let fingerprint = serde_json::to_string(&visit.fingerprint)?;

        sqlx::query(
            r#"
            INSERT INTO fingerprinted_visits (fingerprint, context, short_code, deeplink,
                                              referrer, app_url_scheme, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fingerprint)
        .bind(&visit.context)
        .bind(&visit.short_code)
        .bind(&visit.deeplink)
        .bind(&visit.referrer)
        .bind(&visit.app_url_scheme)
        .bind(visit.timestamp)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn recent_fingerprinted_visits(
        &self,
        since: i64,
        limit: usize,
    ) -> StorageResult<Vec<FingerprintedVisit>> {
        let rows = sqlx::query_as::<_, VisitRow>(
            r#"
            SELECT fingerprint, context, short_code, deeplink, referrer, app_url_scheme, timestamp
            FROM fingerprinted_visits
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(VisitRow::into_visit).collect()
    }

    async fn prune_fingerprinted_visits(&self, before: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM fingerprinted_visits WHERE timestamp < ?")
            .bind(before)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

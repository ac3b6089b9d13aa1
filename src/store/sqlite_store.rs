use super::error::{Result, StoreError};
use super::schema::instances;
use super::traits::InstanceStore;
use crate::types::{AccountId, InstanceId, InstanceRow, NewInstance};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::debug;
use std::sync::Arc;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type SqliteConn = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Queryable, Selectable)]
#[diesel(table_name = instances)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct InstanceRecord {
    id: i32,
    account_id: i32,
    name: String,
    token: String,
    webhook: String,
    jid: String,
    qrcode: String,
    connected: bool,
    events: String,
    expiration: Option<i64>,
}

impl From<InstanceRecord> for InstanceRow {
    fn from(record: InstanceRecord) -> Self {
        InstanceRow {
            id: InstanceId(record.id),
            account_id: AccountId(record.account_id),
            name: record.name,
            token: record.token,
            webhook: record.webhook,
            pairing_identity: record.jid,
            qr_code: record.qrcode,
            connected: record.connected,
            events: record.events,
            expiration: record.expiration,
        }
    }
}

/// Run on every connection the pool hands out.
const CONNECTION_PRAGMAS: &[&str] = &["PRAGMA busy_timeout = 5000;", "PRAGMA synchronous = NORMAL;"];

/// Instance rows are small and writes are serialized, so a few connections do.
const POOL_SIZE: u32 = 4;

#[derive(Debug)]
struct InstancePragmas;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for InstancePragmas {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        CONNECTION_PRAGMAS.iter().try_for_each(|pragma| {
            diesel::sql_query(*pragma)
                .execute(conn)
                .map(drop)
                .map_err(diesel::r2d2::Error::QueryError)
        })
    }
}

/// SQLite-backed [`InstanceStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    /// Read lock for queries, write lock to serialize writers and avoid
    /// SQLITE_BUSY under concurrent pairing updates.
    db_lock: Arc<tokio::sync::RwLock<()>>,
}

impl SqliteStore {
    /// Opens (or creates) the database and brings its schema up to date.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_customizer(Box::new(InstancePragmas))
            .build(ConnectionManager::<SqliteConnection>::new(database_url))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            pool,
            db_lock: Arc::new(tokio::sync::RwLock::new(())),
        };

        store
            .with_write(|conn| {
                diesel::sql_query("PRAGMA journal_mode = WAL;")
                    .execute(conn)
                    .map_err(database_error)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StoreError::Migration(e.to_string()))?;
                Ok(())
            })
            .await?;

        debug!("SqliteStore ready at {database_url}");
        Ok(store)
    }

    async fn with_read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConn) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.db_lock.read().await;
        self.on_pooled_connection(f).await
    }

    async fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConn) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.db_lock.write().await;
        self.on_pooled_connection(f).await
    }

    async fn on_pooled_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConn) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
    }
}

fn database_error(e: DieselError) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ensure_updated(affected: usize, id: InstanceId) -> Result<()> {
    if affected == 0 {
        return Err(StoreError::NotFound(format!("instance {id}")));
    }
    Ok(())
}

fn into_rows(records: Vec<InstanceRecord>) -> Vec<InstanceRow> {
    records.into_iter().map(InstanceRow::from).collect()
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn insert_instance(&self, instance: NewInstance) -> Result<InstanceRow> {
        self.with_write(move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::insert_into(instances::table)
                    .values((
                        instances::account_id.eq(instance.account_id),
                        instances::name.eq(&instance.name),
                        instances::token.eq(&instance.token),
                        instances::webhook.eq(&instance.webhook),
                        instances::events.eq(&instance.events),
                        instances::expiration.eq(instance.expiration),
                    ))
                    .execute(conn)?;

                instances::table
                    .filter(instances::token.eq(&instance.token))
                    .select(InstanceRecord::as_select())
                    .first(conn)
            })
            .map(InstanceRow::from)
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    StoreError::Duplicate("instance token".to_string())
                }
                other => database_error(other),
            })
        })
        .await
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<InstanceRow>> {
        self.with_read(move |conn| {
            instances::table
                .find(id.0)
                .select(InstanceRecord::as_select())
                .first(conn)
                .optional()
                .map(|r| r.map(InstanceRow::from))
                .map_err(database_error)
        })
        .await
    }

    async fn get_instance_by_token(&self, token: &str) -> Result<Option<InstanceRow>> {
        let token = token.to_string();
        self.with_read(move |conn| {
            instances::table
                .filter(instances::token.eq(&token))
                .select(InstanceRecord::as_select())
                .first(conn)
                .optional()
                .map(|r| r.map(InstanceRow::from))
                .map_err(database_error)
        })
        .await
    }

    async fn get_instance_by_id_and_account(
        &self,
        id: InstanceId,
        account_id: AccountId,
    ) -> Result<Option<InstanceRow>> {
        self.with_read(move |conn| {
            instances::table
                .filter(instances::id.eq(id.0))
                .filter(instances::account_id.eq(account_id.0))
                .select(InstanceRecord::as_select())
                .first(conn)
                .optional()
                .map(|r| r.map(InstanceRow::from))
                .map_err(database_error)
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRow>> {
        self.with_read(|conn| {
            instances::table
                .order(instances::id.asc())
                .select(InstanceRecord::as_select())
                .load(conn)
                .map(into_rows)
                .map_err(database_error)
        })
        .await
    }

    async fn list_instances_by_account(&self, account_id: AccountId) -> Result<Vec<InstanceRow>> {
        self.with_read(move |conn| {
            instances::table
                .filter(instances::account_id.eq(account_id.0))
                .order(instances::id.asc())
                .select(InstanceRecord::as_select())
                .load(conn)
                .map(into_rows)
                .map_err(database_error)
        })
        .await
    }

    async fn update_qr_code(&self, id: InstanceId, payload: &str) -> Result<()> {
        let payload = payload.to_string();
        let affected = self
            .with_write(move |conn| {
                diesel::update(instances::table.find(id.0))
                    .set(instances::qrcode.eq(&payload))
                    .execute(conn)
                    .map_err(database_error)
            })
            .await?;
        ensure_updated(affected, id)
    }

    async fn update_pairing(&self, id: InstanceId, identity: &str) -> Result<()> {
        let identity = identity.to_string();
        let affected = self
            .with_write(move |conn| {
                diesel::update(instances::table.find(id.0))
                    .set((
                        instances::jid.eq(&identity),
                        instances::qrcode.eq(""),
                        instances::connected.eq(true),
                    ))
                    .execute(conn)
                    .map_err(database_error)
            })
            .await?;
        ensure_updated(affected, id)
    }

    async fn clear_pairing(&self, id: InstanceId) -> Result<()> {
        let affected = self
            .with_write(move |conn| {
                diesel::update(instances::table.find(id.0))
                    .set((
                        instances::jid.eq(""),
                        instances::qrcode.eq(""),
                        instances::connected.eq(false),
                    ))
                    .execute(conn)
                    .map_err(database_error)
            })
            .await?;
        ensure_updated(affected, id)
    }

    async fn update_connected(&self, id: InstanceId, connected: bool) -> Result<()> {
        let affected = self
            .with_write(move |conn| {
                diesel::update(instances::table.find(id.0))
                    .set(instances::connected.eq(connected))
                    .execute(conn)
                    .map_err(database_error)
            })
            .await?;
        ensure_updated(affected, id)
    }
}

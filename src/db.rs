//! Persistence of agents, reports and report images.
//!
//! Every write is a single statement committed on its own, there is no transaction
//! spanning several calls. Sequencing across calls is left to the ingestion service.

use actix_web::{error::BlockingError, web};
use async_trait::async_trait;
use diesel::{
    connection::SimpleConnection,
    prelude::*,
    r2d2::{self, ConnectionManager, CustomizeConnection, Pool, PoolError},
    result::DatabaseErrorKind,
    SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{info, trace};
use thiserror::Error;

use crate::{
    models::{Agent, AgentChanges, Report, ReportImage},
    schema::{agents, images, reports},
};

/// Migrations creating the metadata schema
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Connection pool to the sqlite file
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Failures of the metadata store
#[derive(Debug, Error)]
pub enum DbError {
    /// No connection could be acquired
    #[error("unable to acquire a database connection: {0}")]
    Pool(#[from] PoolError),
    /// A uniqueness or foreign key constraint rejected the write
    #[error("constraint violated: {0}")]
    Constraint(String),
    /// Any other query failure
    #[error("query failed: {0}")]
    Query(diesel::result::Error),
    /// Applying the schema failed
    #[error("failed to run migrations: {0}")]
    Migration(String),
    /// The blocking task running the query was cancelled
    #[error("database task was cancelled")]
    Blocking,
}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation | DatabaseErrorKind::ForeignKeyViolation,
                info,
            ) => DbError::Constraint(info.message().to_string()),
            e => DbError::Query(e),
        }
    }
}

impl From<BlockingError> for DbError {
    fn from(_: BlockingError) -> Self {
        DbError::Blocking
    }
}

/// Operations the ingestion service and read endpoints need from a metadata store
#[async_trait]
pub trait DbBackend: Send + Sync {
    /// Create the schema if it does not exist yet
    async fn init(&self) -> Result<(), DbError>;

    /// Insert a new agent, fails with [`DbError::Constraint`] if the id is taken
    async fn add_agent(&self, agent: Agent) -> Result<(), DbError>;

    /// Overwrite the `Some` fields of an agent, returns whether the agent exists
    async fn update_agent(&self, id: &str, changes: AgentChanges) -> Result<bool, DbError>;

    /// Look up an agent by id
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DbError>;

    /// All registered agents
    async fn list_agents(&self) -> Result<Vec<Agent>, DbError>;

    /// Insert a report, fails with [`DbError::Constraint`] if the agent is unknown
    async fn add_report(&self, report: Report) -> Result<(), DbError>;

    /// Reports, most recent first
    async fn list_reports(&self, limit: i64, offset: i64) -> Result<Vec<Report>, DbError>;

    /// Look up a report by id
    async fn get_report(&self, id: &str) -> Result<Option<Report>, DbError>;

    /// Reports of one agent, most recent first
    async fn list_reports_by_agent(&self, agent_id: &str) -> Result<Vec<Report>, DbError>;

    /// Insert a report image, fails with [`DbError::Constraint`] if the report is unknown
    async fn add_report_image(&self, image: ReportImage) -> Result<(), DbError>;

    /// Look up a report image by id
    async fn get_report_image(&self, id: &str) -> Result<Option<ReportImage>, DbError>;

    /// Images of one report
    async fn list_report_images(&self, report_id: &str) -> Result<Vec<ReportImage>, DbError>;
}

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(r2d2::Error::QueryError)
    }
}

/// Sqlite backed metadata store
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the sqlite database at `url`
    pub fn new(url: impl Into<String>) -> Result<Self, DbError> {
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder()
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)?;
        Ok(Self { pool })
    }

    async fn run<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        web::block(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl DbBackend for Database {
    async fn init(&self) -> Result<(), DbError> {
        self.run(|conn| {
            let applied = conn
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| DbError::Migration(e.to_string()))?;
            info!("applied {} database migrations", applied.len());
            Ok(())
        })
        .await
    }

    async fn add_agent(&self, agent: Agent) -> Result<(), DbError> {
        trace!("inserting agent {}", agent.id);
        self.run(move |conn| {
            diesel::insert_into(agents::table)
                .values(&agent)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_agent(&self, id: &str, changes: AgentChanges) -> Result<bool, DbError> {
        let id = id.to_string();
        self.run(move |conn| {
            if changes.is_empty() {
                let found = agents::table.find(&id).first::<Agent>(conn).optional()?;
                return Ok(found.is_some());
            }
            let updated = diesel::update(agents::table.find(&id))
                .set(&changes)
                .execute(conn)?;
            Ok(updated > 0)
        })
        .await
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DbError> {
        let id = id.to_string();
        self.run(move |conn| Ok(agents::table.find(id).first::<Agent>(conn).optional()?))
            .await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DbError> {
        self.run(|conn| Ok(agents::table.order(agents::id.asc()).load::<Agent>(conn)?))
            .await
    }

    async fn add_report(&self, report: Report) -> Result<(), DbError> {
        trace!("inserting report {} for agent {}", report.id, report.agent);
        self.run(move |conn| {
            diesel::insert_into(reports::table)
                .values(&report)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_reports(&self, limit: i64, offset: i64) -> Result<Vec<Report>, DbError> {
        self.run(move |conn| {
            Ok(reports::table
                .order((reports::time.desc(), reports::id.asc()))
                .limit(limit)
                .offset(offset)
                .load::<Report>(conn)?)
        })
        .await
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>, DbError> {
        let id = id.to_string();
        self.run(move |conn| Ok(reports::table.find(id).first::<Report>(conn).optional()?))
            .await
    }

    async fn list_reports_by_agent(&self, agent_id: &str) -> Result<Vec<Report>, DbError> {
        let agent_id = agent_id.to_string();
        self.run(move |conn| {
            Ok(reports::table
                .filter(reports::agent.eq(agent_id))
                .order((reports::time.desc(), reports::id.asc()))
                .load::<Report>(conn)?)
        })
        .await
    }

    async fn add_report_image(&self, image: ReportImage) -> Result<(), DbError> {
        trace!("inserting report image {}", image.id);
        self.run(move |conn| {
            diesel::insert_into(images::table)
                .values(&image)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_report_image(&self, id: &str) -> Result<Option<ReportImage>, DbError> {
        let id = id.to_string();
        self.run(move |conn| {
            Ok(images::table
                .find(id)
                .first::<ReportImage>(conn)
                .optional()?)
        })
        .await
    }

    async fn list_report_images(&self, report_id: &str) -> Result<Vec<ReportImage>, DbError> {
        let report_id = report_id.to_string();
        self.run(move |conn| {
            Ok(images::table
                .filter(images::report.eq(report_id))
                .order(images::id.asc())
                .load::<ReportImage>(conn)?)
        })
        .await
    }
}

//! SQLite persistence for service and image records
//!
//! The lifecycle code talks to storage through [`ServiceStore`]; [`Database`]
//! is the SQLite implementation used by the binary and the tests.

use crate::image::ImageRef;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SERVICE_COLUMNS: &str = "id, name, hosts, status, container_id, image_id, network, port, \
                               environment_variables, created";

/// Lifecycle status of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Pulling,
    Created,
    Running,
    Stopped,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pulling => "PULLING",
            ServiceStatus::Created => "CREATED",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Stopped => "STOPPED",
            ServiceStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PULLING" => Ok(ServiceStatus::Pulling),
            "CREATED" => Ok(ServiceStatus::Created),
            "RUNNING" => Ok(ServiceStatus::Running),
            "STOPPED" => Ok(ServiceStatus::Stopped),
            "ERROR" => Ok(ServiceStatus::Error),
            other => anyhow::bail!("unknown service status '{}'", other),
        }
    }
}

/// Persisted image reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    #[serde(flatten)]
    pub image: ImageRef,
    pub created: String,
}

/// Persisted backend service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    pub hosts: Vec<String>,
    pub status: ServiceStatus,
    pub container_id: Option<String>,
    pub image_id: i64,
    pub network: String,
    pub port: Option<u16>,
    pub env: HashMap<String, String>,
    pub created: String,
}

impl ServiceRecord {
    /// URL the service is reachable at on the managed network
    pub fn url(&self) -> Option<String> {
        self.port.map(|port| format!("http://{}:{}", self.name, port))
    }
}

/// Fields required to register a new service
#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub hosts: Vec<String>,
    pub image_id: i64,
    pub network: String,
}

/// Durable storage for services and images
pub trait ServiceStore: Send + Sync {
    fn insert_image(&self, image: &ImageRef) -> Result<i64>;
    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>>;
    fn list_images(&self) -> Result<Vec<ImageRecord>>;

    /// Insert a service with status PULLING, returning its id
    fn insert_service(&self, service: &NewService) -> Result<i64>;
    fn get_service(&self, id: i64) -> Result<Option<ServiceRecord>>;
    fn get_service_by_name(&self, name: &str) -> Result<Option<ServiceRecord>>;
    fn list_services(&self) -> Result<Vec<ServiceRecord>>;
    fn update_status(&self, id: i64, status: ServiceStatus) -> Result<()>;
    fn update_container_id(&self, id: i64, container_id: Option<&str>) -> Result<()>;
    fn update_port(&self, id: i64, port: Option<u16>) -> Result<()>;
    fn update_env(&self, id: i64, env: &HashMap<String, String>) -> Result<()>;
    fn update_hosts(&self, id: i64, hosts: &[String]) -> Result<()>;
    /// Delete a service, returning false if it did not exist
    fn delete_service(&self, id: i64) -> Result<bool>;
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: services and images
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: services and images");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository TEXT NOT NULL,
                name TEXT NOT NULL,
                tag TEXT NOT NULL,
                created TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                hosts TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'PULLING',
                container_id TEXT,
                image_id INTEGER NOT NULL,
                network TEXT NOT NULL,
                port INTEGER,
                environment_variables TEXT NOT NULL DEFAULT '{}',
                created TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (image_id) REFERENCES images(id)
            );

            CREATE INDEX IF NOT EXISTS idx_services_image ON services(image_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
        Ok(ImageRecord {
            id: row.get(0)?,
            image: ImageRef {
                repository: row.get(1)?,
                name: row.get(2)?,
                tag: row.get(3)?,
            },
            created: row.get(4)?,
        })
    }

    fn service_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
        let hosts: String = row.get(2)?;
        let status: String = row.get(3)?;
        let env: String = row.get(8)?;

        Ok(ServiceRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            hosts: split_hosts(&hosts),
            status: status
                .parse::<ServiceStatus>()
                .map_err(|e| conversion_error(3, e.into()))?,
            container_id: row.get(4)?,
            image_id: row.get(5)?,
            network: row.get(6)?,
            port: row.get(7)?,
            env: serde_json::from_str(&env).map_err(|e| conversion_error(8, Box::new(e)))?,
            created: row.get(9)?,
        })
    }

    fn update_service_column(&self, id: i64, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(sql, params![value, id])?;
        if rows == 0 {
            anyhow::bail!("service {} does not exist", id);
        }
        Ok(())
    }
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err)
}

fn join_hosts(hosts: &[String]) -> String {
    hosts.join(",")
}

fn split_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

impl ServiceStore for Database {
    fn insert_image(&self, image: &ImageRef) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO images (repository, name, tag) VALUES (?1, ?2, ?3)",
            params![image.repository, image.name, image.tag],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, repository, name, tag, created FROM images WHERE id = ?1",
            params![id],
            Self::image_from_row,
        )
        .optional()
        .context("Failed to get image")
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, repository, name, tag, created FROM images ORDER BY id")?;
        let images = stmt
            .query_map([], Self::image_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    fn insert_service(&self, service: &NewService) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO services (name, hosts, status, image_id, network) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                service.name,
                join_hosts(&service.hosts),
                ServiceStatus::Pulling.as_str(),
                service.image_id,
                service.network
            ],
        )
        .with_context(|| format!("Failed to insert service '{}'", service.name))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_service(&self, id: i64) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            Self::service_from_row,
        )
        .optional()
        .context("Failed to get service")
    }

    fn get_service_by_name(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM services WHERE name = ?1", SERVICE_COLUMNS),
            params![name],
            Self::service_from_row,
        )
        .optional()
        .context("Failed to get service by name")
    }

    fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services ORDER BY id",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map([], Self::service_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    fn update_status(&self, id: i64, status: ServiceStatus) -> Result<()> {
        self.update_service_column(
            id,
            "UPDATE services SET status = ?1 WHERE id = ?2",
            &status.as_str(),
        )
    }

    fn update_container_id(&self, id: i64, container_id: Option<&str>) -> Result<()> {
        self.update_service_column(
            id,
            "UPDATE services SET container_id = ?1 WHERE id = ?2",
            &container_id,
        )
    }

    fn update_port(&self, id: i64, port: Option<u16>) -> Result<()> {
        self.update_service_column(id, "UPDATE services SET port = ?1 WHERE id = ?2", &port)
    }

    fn update_env(&self, id: i64, env: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string(env)?;
        self.update_service_column(
            id,
            "UPDATE services SET environment_variables = ?1 WHERE id = ?2",
            &json,
        )
    }

    fn update_hosts(&self, id: i64, hosts: &[String]) -> Result<()> {
        self.update_service_column(
            id,
            "UPDATE services SET hosts = ?1 WHERE id = ?2",
            &join_hosts(hosts),
        )
    }

    fn delete_service(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}

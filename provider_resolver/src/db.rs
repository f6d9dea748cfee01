use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{fs, path::Path, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS providers (
        npi TEXT PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        degree TEXT,
        email TEXT,
        phone_number TEXT,
        created_at_unix INTEGER NOT NULL,
        updated_at_unix INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_providers_name ON providers(last_name, first_name);
    CREATE TABLE IF NOT EXISTS provider_specialties (
        npi TEXT NOT NULL REFERENCES providers(npi),
        specialty TEXT NOT NULL,
        PRIMARY KEY (npi, specialty)
    );
    CREATE INDEX IF NOT EXISTS idx_provider_specialties_specialty
        ON provider_specialties(specialty);
    CREATE TABLE IF NOT EXISTS provider_locations (
        npi TEXT NOT NULL REFERENCES providers(npi),
        street TEXT NOT NULL,
        city TEXT NOT NULL,
        state TEXT NOT NULL,
        zip_code TEXT NOT NULL,
        lat REAL,
        lng REAL,
        PRIMARY KEY (npi, street, city, state, zip_code)
    );
    CREATE INDEX IF NOT EXISTS idx_provider_locations_lat_lng ON provider_locations(lat, lng);
    CREATE TABLE IF NOT EXISTS provider_insurances (
        npi TEXT NOT NULL REFERENCES providers(npi),
        insurance_id INTEGER NOT NULL,
        PRIMARY KEY (npi, insurance_id)
    );
    CREATE TABLE IF NOT EXISTS specialties (
        code TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE IF NOT EXISTS pending_resolutions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query_json TEXT NOT NULL,
        reason TEXT NOT NULL,
        last_error TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at_unix INTEGER NOT NULL,
        updated_at_unix INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_resolutions_reason ON pending_resolutions(reason);
";

/// Shared SQLite handle for the directory, the specialty vocabulary and the
/// pending-resolution queue.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating database dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening database {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("Failed enabling WAL journal")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed initializing database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

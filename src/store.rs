use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::info;

use crate::error::DeterrentError;
use crate::messages::{AlertRecord, DetectionRecord, Severity};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only persistence sink owned by the web layer. The detection side never reads back.
pub trait AlertStore: Send + Sync {
    fn record_detection(
        &self,
        user_id: i64,
        animal_type: &str,
        location: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError>;

    fn record_alert(
        &self,
        user_id: i64,
        message: &str,
        severity: Severity,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError>;
}

/// SQLite sink sharing the web application's database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, DeterrentError> {
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        info!("Opened detection database at {}", db_path.as_ref().display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, DeterrentError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DeterrentError> {
        self.conn
            .lock()
            .map_err(|_| DeterrentError::Other("database connection lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), DeterrentError> {
        self.connection()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              animal_type TEXT NOT NULL,
              location TEXT,
              timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              message TEXT NOT NULL,
              alert_type TEXT DEFAULT 'warning',
              timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;
        Ok(())
    }

    pub fn count_detections(&self) -> Result<u64, DeterrentError> {
        let count: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_alerts(&self) -> Result<u64, DeterrentError> {
        let count: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl AlertStore for SqliteStore {
    fn record_detection(
        &self,
        user_id: i64,
        animal_type: &str,
        location: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO detections (user_id, animal_type, location, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                animal_type,
                location,
                timestamp.format(TIMESTAMP_FORMAT).to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_alert(
        &self,
        user_id: i64,
        message: &str,
        severity: Severity,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO alerts (user_id, message, alert_type, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                message,
                severity.as_str(),
                timestamp.format(TIMESTAMP_FORMAT).to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

/// Process-local sink, used for dry runs without a database and in tests.
#[derive(Default)]
pub struct MemoryStore {
    detections: Mutex<Vec<DetectionRecord>>,
    alerts: Mutex<Vec<AlertRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detections(&self) -> Vec<DetectionRecord> {
        self.detections
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl AlertStore for MemoryStore {
    fn record_detection(
        &self,
        user_id: i64,
        animal_type: &str,
        location: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError> {
        let mut records = self
            .detections
            .lock()
            .map_err(|_| DeterrentError::Other("detection records lock poisoned".to_string()))?;
        let id = records.len() as i64 + 1;
        records.push(DetectionRecord {
            id,
            user_id,
            animal_type: animal_type.to_string(),
            location: location.to_string(),
            timestamp,
        });
        Ok(id)
    }

    fn record_alert(
        &self,
        user_id: i64,
        message: &str,
        severity: Severity,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DeterrentError> {
        let mut records = self
            .alerts
            .lock()
            .map_err(|_| DeterrentError::Other("alert records lock poisoned".to_string()))?;
        let id = records.len() as i64 + 1;
        records.push(AlertRecord {
            id,
            user_id,
            message: message.to_string(),
            alert_type: severity,
            timestamp,
        });
        Ok(id)
    }
}

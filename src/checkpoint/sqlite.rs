//! SQLite 检查点存储
//!
//! rusqlite 同步连接放在 Mutex 中，所有访问经 spawn_blocking 执行，避免阻塞异步运行时。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::checkpoint::store::{CheckpointError, CheckpointStore};
use crate::checkpoint::types::*;

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS research_checkpoints (
                operation_id TEXT PRIMARY KEY,
                checkpoint_type TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, CheckpointError>
    where
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CheckpointError::Unavailable("connection lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| CheckpointError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save_checkpoint(
        &self,
        operation_id: &str,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<(), CheckpointError> {
        let state_json = serde_json::to_string(state)?;
        let operation_id = operation_id.to_string();
        let created_at = chrono::Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO research_checkpoints
                 (operation_id, checkpoint_type, state, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![operation_id, kind.as_str(), state_json, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let operation_id = operation_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT checkpoint_type, state, created_at
                     FROM research_checkpoints WHERE operation_id = ?1",
                    params![operation_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            let (kind, state, created_at) = match row {
                Some(r) => r,
                None => return Ok(None),
            };
            let kind = CheckpointKind::parse(&kind).ok_or_else(|| {
                CheckpointError::Unavailable(format!("unknown checkpoint type '{kind}'"))
            })?;
            Ok(Some(Checkpoint {
                operation_id,
                kind,
                state: serde_json::from_str(&state)?,
                created_at,
            }))
        })
        .await
    }

    async fn delete_checkpoint(&self, operation_id: &str) -> Result<bool, CheckpointError> {
        let operation_id = operation_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM research_checkpoints WHERE operation_id = ?1",
                params![operation_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}

//! 内存操作存储（可选 SQLite 持久化）
//!
//! 所有记录保存在内存中；启用 `async-sqlite` feature 后每次变更同步写入 SQLite，
//! 启动时恢复非终态记录，供协调器的启动扫描继续推进。

use std::collections::HashMap;
#[cfg(feature = "async-sqlite")]
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::operations::store::{OperationStore, StoreError};
use crate::operations::types::*;

/// 内存操作存储
pub struct InMemoryOperationStore {
    /// 所有记录
    records: RwLock<HashMap<OperationId, OperationRecord>>,
    /// 运行中任务的取消令牌
    tokens: RwLock<HashMap<OperationId, CancellationToken>>,
    /// SQLite 连接池（可选）
    #[cfg(feature = "async-sqlite")]
    pool: Option<sqlx::sqlite::SqlitePool>,
}

impl Default for InMemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            #[cfg(feature = "async-sqlite")]
            pool: None,
        }
    }

    /// 创建持久化版存储，并从数据库恢复全部记录
    #[cfg(feature = "async-sqlite")]
    pub async fn with_persistence(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                parent_id TEXT,
                metadata TEXT NOT NULL,
                progress TEXT NOT NULL,
                result_summary TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_parent ON operations(parent_id)")
            .execute(&pool)
            .await?;

        let store = Self {
            records: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            pool: Some(pool),
        };
        store.restore_records().await?;
        Ok(store)
    }

    #[cfg(feature = "async-sqlite")]
    async fn restore_records(&self) -> Result<(), sqlx::Error> {
        use sqlx::Row;

        let pool = match &self.pool {
            Some(p) => p,
            None => return Ok(()),
        };

        let rows = sqlx::query(
            "SELECT id, kind, status, parent_id, metadata, progress, result_summary, error,
                    created_at, started_at, completed_at
             FROM operations
             ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await?;

        let mut records = self.records.write().await;
        let mut active = 0usize;
        for row in rows {
            let kind = match OperationKind::parse(row.get::<String, _>("kind").as_str()) {
                Some(k) => k,
                None => continue,
            };
            let status = match OperationStatus::parse(row.get::<String, _>("status").as_str()) {
                Some(s) => s,
                None => continue,
            };
            let record = OperationRecord {
                id: row.get("id"),
                kind,
                status,
                parent_id: row.get("parent_id"),
                metadata: serde_json::from_str(row.get::<String, _>("metadata").as_str())
                    .unwrap_or_default(),
                progress: serde_json::from_str(row.get::<String, _>("progress").as_str())
                    .unwrap_or_default(),
                result_summary: row
                    .get::<Option<String>, _>("result_summary")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                error: row.get("error"),
                created_at: row.get("created_at"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
            };
            if record.status.is_active() {
                active += 1;
            }
            records.insert(record.id.clone(), record);
        }

        if !records.is_empty() {
            tracing::info!(total = records.len(), active, "Restored operations from database");
        }
        Ok(())
    }

    #[cfg(feature = "async-sqlite")]
    async fn persist(&self, record: &OperationRecord) {
        let pool = match &self.pool {
            Some(p) => p,
            None => return,
        };
        let metadata = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".into());
        let progress = serde_json::to_string(&record.progress).unwrap_or_else(|_| "{}".into());
        let result_summary = record
            .result_summary
            .as_ref()
            .and_then(|r| serde_json::to_string(r).ok());

        let res = sqlx::query(
            "INSERT OR REPLACE INTO operations
             (id, kind, status, parent_id, metadata, progress, result_summary, error,
              created_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.parent_id)
        .bind(&metadata)
        .bind(&progress)
        .bind(&result_summary)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(pool)
        .await;

        if let Err(e) = res {
            tracing::warn!(operation_id = %record.id, "Failed to persist operation: {}", e);
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    async fn persist(&self, _record: &OperationRecord) {}

    /// 在写锁内修改记录，返回修改后的副本用于持久化
    async fn mutate<F, T>(&self, id: &str, f: F) -> Result<(T, OperationRecord), StoreError>
    where
        F: FnOnce(&mut OperationRecord) -> T,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let out = f(record);
        Ok((out, record.clone()))
    }

    /// 终态迁移；已终态时不修改
    async fn finish<F>(&self, id: &str, status: OperationStatus, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut OperationRecord),
    {
        let (changed, snapshot) = self
            .mutate(id, |record| {
                if record.is_finished() {
                    return false;
                }
                record.status = status;
                record.completed_at = Some(chrono::Utc::now().timestamp_millis());
                f(record);
                true
            })
            .await?;

        if changed {
            let token = self.tokens.write().await.remove(id);
            if status == OperationStatus::Cancelled {
                if let Some(token) = token {
                    token.cancel();
                }
            }
            self.persist(&snapshot).await;
        }
        Ok(changed)
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create_operation(
        &self,
        kind: OperationKind,
        metadata: OperationMetadata,
        parent_id: Option<OperationId>,
    ) -> Result<OperationRecord, StoreError> {
        let record = OperationRecord::new(kind, metadata, parent_id);
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        self.persist(&record).await;
        tracing::debug!(operation_id = %record.id, kind = %kind, "Operation created");
        Ok(record)
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn start_operation(&self, id: &str, token: CancellationToken) -> Result<(), StoreError> {
        let (started, snapshot) = self
            .mutate(id, |record| {
                if record.is_finished() {
                    return false;
                }
                record.status = OperationStatus::Running;
                if record.started_at.is_none() {
                    record.started_at = Some(chrono::Utc::now().timestamp_millis());
                }
                true
            })
            .await?;

        if started {
            self.tokens.write().await.insert(id.to_string(), token);
            self.persist(&snapshot).await;
        } else {
            // 已终态（例如启动前被取消）：立即传播取消
            token.cancel();
        }
        Ok(())
    }

    async fn complete_operation(&self, id: &str, result: ParameterMap) -> Result<bool, StoreError> {
        self.finish(id, OperationStatus::Completed, |record| {
            record.result_summary = Some(result);
            record.progress.percentage = 100.0;
        })
        .await
    }

    async fn fail_operation(&self, id: &str, error: &str) -> Result<bool, StoreError> {
        let error = error.to_string();
        self.finish(id, OperationStatus::Failed, |record| {
            record.error = Some(error);
        })
        .await
    }

    async fn cancel_operation(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        let reason = reason.to_string();
        self.finish(id, OperationStatus::Cancelled, |record| {
            record.error = Some(reason);
        })
        .await
    }

    async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError> {
        let ((), snapshot) = self
            .mutate(id, |record| {
                record.progress = progress;
            })
            .await?;
        self.persist(&snapshot).await;
        Ok(())
    }

    async fn update_parameters(&self, id: &str, parameters: ParameterMap) -> Result<(), StoreError> {
        let (updated, snapshot) = self
            .mutate(id, |record| {
                if record.is_finished() {
                    return false;
                }
                record.metadata.parameters = parameters;
                true
            })
            .await?;
        if !updated {
            return Err(StoreError::Finished(id.to_string()));
        }
        self.persist(&snapshot).await;
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[OperationStatus],
        to: OperationStatus,
    ) -> Result<bool, StoreError> {
        let (changed, snapshot) = self
            .mutate(id, |record| {
                if !from.contains(&record.status) {
                    return false;
                }
                record.status = to;
                if to.is_active() {
                    record.completed_at = None;
                    record.error = None;
                }
                true
            })
            .await?;
        if changed {
            self.persist(&snapshot).await;
        }
        Ok(changed)
    }

    async fn list_operations(&self, filter: &OperationFilter) -> Result<OperationList, StoreError> {
        let records = self.records.read().await;
        let mut items: Vec<OperationRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = items.len();
        let active_count = items.iter().filter(|r| r.status.is_active()).count();
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(OperationList {
            items,
            total,
            active_count,
        })
    }
}


#[cfg(all(test, feature = "async-sqlite"))]
mod sqlite_tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_restore_from_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("operations.db");

        let id = {
            let store = InMemoryOperationStore::with_persistence(&db_path).await.unwrap();
            let mut params = ParameterMap::new();
            params.insert("phase".into(), serde_json::json!("training"));
            let record = store
                .create_operation(
                    OperationKind::Research,
                    OperationMetadata::with_parameters(params),
                    None,
                )
                .await
                .unwrap();
            store
                .start_operation(&record.id, CancellationToken::new())
                .await
                .unwrap();
            record.id
        };

        let store = InMemoryOperationStore::with_persistence(&db_path).await.unwrap();
        let restored = store.get_operation(&id).await.unwrap().unwrap();
        assert_eq!(restored.status, OperationStatus::Running);
        assert_eq!(
            restored.metadata.parameters.get("phase"),
            Some(&serde_json::json!("training"))
        );
    }
}

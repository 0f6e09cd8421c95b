//! SQL state backend — single-file sqlite database via sqlx.
//!
//! One table per entity, JSON blobs for the rich structs, and DEFERRABLE
//! foreign keys so multi-step updates inside one transaction can violate
//! referential integrity until commit. Entity semantics are identical to the
//! KV backend; the two share the JSON encoding and the migration rules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::conf::EngineConfig;
use crate::entity::{
    ContainerConfig, ContainerState, ExecSession, PerNetworkOptions, PodConfig, PodState,
    VolumeConfig, VolumeState,
};
use crate::errors::EngineError;
use crate::util::now_unix;

use super::dbconfig::{self, DBConfig};
use super::{check_exit_code, lookup_failure, match_prefix, PrefixMatch, StateStore};

/// Database file inside the static dir.
pub const SQL_DB_FILE: &str = "sql_state.db";

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS SchemaVersion (
    ID      INTEGER PRIMARY KEY CHECK (ID = 1),
    Version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS DBConfig (
    Name  TEXT PRIMARY KEY,
    Value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS IDNamespace (
    ID TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS ContainerConfig (
    ID    TEXT PRIMARY KEY REFERENCES IDNamespace (ID) DEFERRABLE INITIALLY DEFERRED,
    Name  TEXT NOT NULL UNIQUE,
    PodID TEXT,
    JSON  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ContainerState (
    ID   TEXT PRIMARY KEY REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    JSON TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ContainerDependency (
    ID           TEXT NOT NULL REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    DependencyID TEXT NOT NULL REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    PRIMARY KEY (ID, DependencyID)
);
CREATE TABLE IF NOT EXISTS ContainerVolume (
    ContainerID TEXT NOT NULL REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    VolumeName  TEXT NOT NULL REFERENCES VolumeConfig (Name) DEFERRABLE INITIALLY DEFERRED,
    PRIMARY KEY (ContainerID, VolumeName)
);
CREATE TABLE IF NOT EXISTS ContainerExecSession (
    ID          TEXT PRIMARY KEY,
    ContainerID TEXT NOT NULL REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    JSON        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ContainerExitCode (
    ID        TEXT PRIMARY KEY,
    Timestamp INTEGER NOT NULL,
    ExitCode  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS PodConfig (
    ID   TEXT PRIMARY KEY REFERENCES IDNamespace (ID) DEFERRABLE INITIALLY DEFERRED,
    Name TEXT NOT NULL UNIQUE,
    JSON TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS PodState (
    ID   TEXT PRIMARY KEY REFERENCES PodConfig (ID) DEFERRABLE INITIALLY DEFERRED,
    JSON TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS VolumeConfig (
    Name      TEXT PRIMARY KEY,
    StorageID TEXT,
    JSON      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS VolumeState (
    Name TEXT PRIMARY KEY REFERENCES VolumeConfig (Name) DEFERRABLE INITIALLY DEFERRED,
    JSON TEXT NOT NULL
);
"#;

pub struct SqlState {
    pool: SqlitePool,
    closed: AtomicBool,
}

impl SqlState {
    /// Open (or create) the sqlite database inside `static_dir`.
    pub async fn open(static_dir: &Path) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::new()
            .filename(static_dir.join(SQL_DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let mut tx = pool.begin().await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        sqlx::query("INSERT OR IGNORE INTO SchemaVersion (ID, Version) VALUES (1, ?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let version: i64 = sqlx::query("SELECT Version FROM SchemaVersion WHERE ID = 1")
            .fetch_one(&pool)
            .await?
            .get(0);
        if version > SCHEMA_VERSION {
            return Err(EngineError::DBBadConfig(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        Ok(SqlState {
            pool,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::DBClosed);
        }
        Ok(())
    }

    async fn ctr_exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(sqlx::query("SELECT 1 FROM ContainerConfig WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    async fn pod_exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(sqlx::query("SELECT 1 FROM PodConfig WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    /// Reject a new name/ID clashing with the container/pod union,
    /// distinguishing the owning kind for the error.
    async fn check_registry_free(&self, id: &str, name: &str) -> Result<(), EngineError> {
        if sqlx::query("SELECT 1 FROM IDNamespace WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            return Err(if self.pod_exists(id).await? {
                EngineError::PodExists(id.to_string())
            } else {
                EngineError::CtrExists(id.to_string())
            });
        }
        if sqlx::query("SELECT 1 FROM ContainerConfig WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            return Err(EngineError::CtrExists(name.to_string()));
        }
        if sqlx::query("SELECT 1 FROM PodConfig WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            return Err(EngineError::PodExists(name.to_string()));
        }
        Ok(())
    }

    async fn load_ctr_config(&self, id: &str) -> Result<ContainerConfig, EngineError> {
        let row = sqlx::query("SELECT JSON FROM ContainerConfig WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        let mut config: ContainerConfig = serde_json::from_str(&row.get::<String, _>(0))?;
        if config.migrate() {
            // Lazy rewrite of migrated records; non-fatal on failure.
            let json = serde_json::to_string(&config)?;
            if let Err(e) = sqlx::query("UPDATE ContainerConfig SET JSON = ? WHERE ID = ?")
                .bind(&json)
                .bind(id)
                .execute(&self.pool)
                .await
            {
                tracing::warn!(ctr = id, error = %e, "failed to persist migrated container config");
            }
        }
        Ok(config)
    }

    async fn save_ctr_config(&self, config: &ContainerConfig) -> Result<(), EngineError> {
        sqlx::query("UPDATE ContainerConfig SET JSON = ? WHERE ID = ?")
            .bind(serde_json::to_string(config)?)
            .bind(&config.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_container_inner(
        &self,
        pod_id: Option<&str>,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        self.check_registry_free(&config.id, &config.name).await?;

        if let Some(pod) = pod_id {
            if !self.pod_exists(pod).await? {
                return Err(EngineError::NoSuchPod(pod.to_string()));
            }
        }

        for dep in &config.dependencies {
            let row = sqlx::query("SELECT PodID FROM ContainerConfig WHERE ID = ?")
                .bind(dep)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| EngineError::NoSuchCtr(dep.to_string()))?;
            let dep_pod: Option<String> = row.get(0);
            if dep_pod.as_deref() != pod_id {
                return Err(EngineError::InvalidArg(format!(
                    "container {} depends on {}, which is in a different pod",
                    config.id, dep
                )));
            }
        }

        for vol in &config.named_volumes {
            if sqlx::query("SELECT 1 FROM VolumeConfig WHERE Name = ?")
                .bind(&vol.name)
                .fetch_optional(&self.pool)
                .await?
                .is_none()
            {
                return Err(EngineError::NoSuchVolume(vol.name.clone()));
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO IDNamespace (ID) VALUES (?)")
            .bind(&config.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO ContainerConfig (ID, Name, PodID, JSON) VALUES (?, ?, ?, ?)")
            .bind(&config.id)
            .bind(&config.name)
            .bind(pod_id)
            .bind(serde_json::to_string(config)?)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO ContainerState (ID, JSON) VALUES (?, ?)")
            .bind(&config.id)
            .bind(serde_json::to_string(state)?)
            .execute(&mut *tx)
            .await?;
        for dep in &config.dependencies {
            sqlx::query("INSERT INTO ContainerDependency (ID, DependencyID) VALUES (?, ?)")
                .bind(&config.id)
                .bind(dep)
                .execute(&mut *tx)
                .await?;
        }
        for vol in &config.named_volumes {
            sqlx::query("INSERT INTO ContainerVolume (ContainerID, VolumeName) VALUES (?, ?)")
                .bind(&config.id)
                .bind(&vol.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_container_inner(
        &self,
        pod_id: Option<&str>,
        id: &str,
    ) -> Result<(), EngineError> {
        self.check_open()?;

        let row = sqlx::query("SELECT PodID FROM ContainerConfig WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        let stored_pod: Option<String> = row.get(0);
        match (pod_id, stored_pod.as_deref()) {
            (None, Some(pod)) => {
                return Err(EngineError::InvalidArg(format!(
                    "container {} is a member of pod {}, remove it through the pod",
                    id, pod
                )))
            }
            (Some(requested), stored) if stored != Some(requested) => {
                return Err(EngineError::InvalidArg(format!(
                    "container {} is not a member of pod {}",
                    id, requested
                )))
            }
            _ => {}
        }

        let sessions = sqlx::query("SELECT ID FROM ContainerExecSession WHERE ContainerID = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        if !sessions.is_empty() {
            let ids: Vec<String> = sessions.iter().map(|r| r.get(0)).collect();
            return Err(EngineError::Internal(format!(
                "container {} has active exec sessions: {}",
                id,
                ids.join(", ")
            )));
        }

        let dependents = sqlx::query("SELECT ID FROM ContainerDependency WHERE DependencyID = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        if !dependents.is_empty() {
            let ids: Vec<String> = dependents.iter().map(|r| r.get(0)).collect();
            return Err(EngineError::DepExists {
                id: id.to_string(),
                deps: ids.join(", "),
            });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ContainerDependency WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ContainerVolume WHERE ContainerID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ContainerState WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ContainerConfig WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM IDNamespace WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqlState {
    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close().await;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), EngineError> {
        self.check_open()?;

        let rows = sqlx::query("SELECT ID, JSON FROM ContainerState")
            .fetch_all(&self.pool)
            .await?;
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let id: String = row.get(0);
            let mut state: ContainerState = serde_json::from_str(&row.get::<String, _>(1))?;
            state.reset_transient();
            sqlx::query("UPDATE ContainerState SET JSON = ? WHERE ID = ?")
                .bind(serde_json::to_string(&state)?)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }

        let rows = sqlx::query("SELECT ID, JSON FROM PodState")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let id: String = row.get(0);
            let mut state: PodState = serde_json::from_str(&row.get::<String, _>(1))?;
            state.reset_transient();
            sqlx::query("UPDATE PodState SET JSON = ? WHERE ID = ?")
                .bind(serde_json::to_string(&state)?)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }

        let rows = sqlx::query("SELECT Name, JSON FROM VolumeState")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let name: String = row.get(0);
            let mut state: VolumeState = serde_json::from_str(&row.get::<String, _>(1))?;
            state.reset_transient();
            sqlx::query("UPDATE VolumeState SET JSON = ? WHERE Name = ?")
                .bind(serde_json::to_string(&state)?)
                .bind(&name)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM ContainerExecSession")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn db_config(&self) -> Result<DBConfig, EngineError> {
        self.check_open()?;
        let rows = sqlx::query("SELECT Name, Value FROM DBConfig")
            .fetch_all(&self.pool)
            .await?;
        let mut stored = DBConfig::default();
        for row in rows {
            stored.set_field(&row.get::<String, _>(0), row.get(1));
        }
        Ok(stored)
    }

    async fn validate_db_config(
        &self,
        config: &EngineConfig,
        lenient: bool,
    ) -> Result<(), EngineError> {
        let stored = self.db_config().await?;
        let missing = dbconfig::compare(&stored, config, lenient)?;
        if !missing.is_empty() {
            let mut tx = self.pool.begin().await?;
            for (name, value) in missing {
                sqlx::query("INSERT OR REPLACE INTO DBConfig (Name, Value) VALUES (?, ?)")
                    .bind(name)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn add_container(
        &self,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        if config.pod_id.is_some() {
            return Err(EngineError::InvalidArg(
                "container has a pod; add it through the pod".to_string(),
            ));
        }
        self.add_container_inner(None, config, state).await
    }

    async fn add_container_to_pod(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        if config.pod_id.as_deref() != Some(pod_id) {
            return Err(EngineError::InvalidArg(format!(
                "container config names pod {:?} but was added to pod {}",
                config.pod_id, pod_id
            )));
        }
        self.add_container_inner(Some(pod_id), config, state).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.remove_container_inner(None, id).await
    }

    async fn remove_container_from_pod(&self, pod_id: &str, id: &str) -> Result<(), EngineError> {
        self.remove_container_inner(Some(pod_id), id).await
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT JSON FROM ContainerState WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        Ok(serde_json::from_str(&row.get::<String, _>(0))?)
    }

    async fn save_container(&self, id: &str, state: &ContainerState) -> Result<(), EngineError> {
        self.check_open()?;
        let result = sqlx::query("UPDATE ContainerState SET JSON = ? WHERE ID = ?")
            .bind(serde_json::to_string(state)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        Ok(())
    }

    async fn container_config(&self, id: &str) -> Result<ContainerConfig, EngineError> {
        self.check_open()?;
        self.load_ctr_config(id).await
    }

    async fn has_container(&self, id: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        self.ctr_exists(id).await
    }

    async fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerState)>, EngineError> {
        self.check_open()?;
        let rows = sqlx::query(
            "SELECT c.ID, s.JSON FROM ContainerConfig c JOIN ContainerState s ON c.ID = s.ID",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let id: String = row.get(0);
            let state: ContainerState = serde_json::from_str(&row.get::<String, _>(1))?;
            out.push((self.load_ctr_config(&id).await?, state));
        }
        Ok(out)
    }

    async fn lookup_container_id(&self, id_or_name: &str) -> Result<String, EngineError> {
        self.check_open()?;

        if self.ctr_exists(id_or_name).await? {
            return Ok(id_or_name.to_string());
        }

        let mut name_was_pod = false;
        if let Some(row) = sqlx::query("SELECT ID FROM ContainerConfig WHERE Name = ?")
            .bind(id_or_name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get(0));
        }
        if sqlx::query("SELECT 1 FROM PodConfig WHERE Name = ?")
            .bind(id_or_name)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            name_was_pod = true;
        }

        let ids: Vec<String> = sqlx::query("SELECT ID FROM ContainerConfig")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();
        match match_prefix(ids, id_or_name) {
            PrefixMatch::Unique(id) => Ok(id),
            PrefixMatch::Ambiguous => Err(EngineError::CtrExists(format!(
                "more than one result for container ID prefix {}",
                id_or_name
            ))),
            PrefixMatch::None => Err(lookup_failure(id_or_name, name_was_pod)),
        }
    }

    async fn container_dependents(&self, id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        if !self.ctr_exists(id).await? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        Ok(
            sqlx::query("SELECT ID FROM ContainerDependency WHERE DependencyID = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect(),
        )
    }

    async fn rewrite_container_config(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let old = self.load_ctr_config(id).await?;
        if old.id != config.id || old.name != config.name || old.pod_id != config.pod_id {
            return Err(EngineError::InvalidArg(
                "config rewrite must not change ID, name, or pod".to_string(),
            ));
        }
        self.save_ctr_config(config).await
    }

    async fn safe_rewrite_container_config(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let old = self.load_ctr_config(id).await?;
        if old.id != config.id || old.pod_id != config.pod_id {
            return Err(EngineError::InvalidArg(
                "config rewrite must not change ID or pod".to_string(),
            ));
        }
        if old.name != old_name {
            return Err(EngineError::InvalidArg(format!(
                "container {} is named {}, not {}",
                id, old.name, old_name
            )));
        }
        if config.name != new_name {
            return Err(EngineError::InvalidArg(
                "new config does not carry the new name".to_string(),
            ));
        }

        if old_name != new_name {
            if let Some(row) = sqlx::query("SELECT ID FROM ContainerConfig WHERE Name = ?")
                .bind(new_name)
                .fetch_optional(&self.pool)
                .await?
            {
                let owner: String = row.get(0);
                if owner != id {
                    return Err(EngineError::CtrExists(new_name.to_string()));
                }
            }
            if sqlx::query("SELECT 1 FROM PodConfig WHERE Name = ?")
                .bind(new_name)
                .fetch_optional(&self.pool)
                .await?
                .is_some()
            {
                return Err(EngineError::PodExists(new_name.to_string()));
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE ContainerConfig SET Name = ?, JSON = ? WHERE ID = ?")
            .bind(new_name)
            .bind(serde_json::to_string(config)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rewrite_pod_config(&self, id: &str, config: &PodConfig) -> Result<(), EngineError> {
        self.check_open()?;
        let old = self.pod_config(id).await?;
        if old.id != config.id || old.name != config.name {
            return Err(EngineError::InvalidArg(
                "pod config rewrite must not change ID or name".to_string(),
            ));
        }
        sqlx::query("UPDATE PodConfig SET JSON = ? WHERE ID = ?")
            .bind(serde_json::to_string(config)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rewrite_volume_config(
        &self,
        name: &str,
        config: &VolumeConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.has_volume(name).await? {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        if config.name != name {
            return Err(EngineError::InvalidArg(
                "volume config rewrite must not change the name".to_string(),
            ));
        }
        sqlx::query("UPDATE VolumeConfig SET JSON = ? WHERE Name = ?")
            .bind(serde_json::to_string(config)?)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_pod(&self, config: &PodConfig, state: &PodState) -> Result<(), EngineError> {
        self.check_open()?;
        self.check_registry_free(&config.id, &config.name).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO IDNamespace (ID) VALUES (?)")
            .bind(&config.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO PodConfig (ID, Name, JSON) VALUES (?, ?, ?)")
            .bind(&config.id)
            .bind(&config.name)
            .bind(serde_json::to_string(config)?)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO PodState (ID, JSON) VALUES (?, ?)")
            .bind(&config.id)
            .bind(serde_json::to_string(state)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_pod(&self, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.pod_exists(id).await? {
            return Err(EngineError::NoSuchPod(id.to_string()));
        }
        let members = sqlx::query("SELECT ID FROM ContainerConfig WHERE PodID = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        if !members.is_empty() {
            let ids: Vec<String> = members.iter().map(|r| r.get(0)).collect();
            return Err(EngineError::Internal(format!(
                "pod {} still contains containers: {}",
                id,
                ids.join(", ")
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM PodState WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM PodConfig WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM IDNamespace WHERE ID = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pod_state(&self, id: &str) -> Result<PodState, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT JSON FROM PodState WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        Ok(serde_json::from_str(&row.get::<String, _>(0))?)
    }

    async fn save_pod(&self, id: &str, state: &PodState) -> Result<(), EngineError> {
        self.check_open()?;
        let result = sqlx::query("UPDATE PodState SET JSON = ? WHERE ID = ?")
            .bind(serde_json::to_string(state)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchPod(id.to_string()));
        }
        Ok(())
    }

    async fn pod_config(&self, id: &str) -> Result<PodConfig, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT JSON FROM PodConfig WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        Ok(serde_json::from_str(&row.get::<String, _>(0))?)
    }

    async fn has_pod(&self, id: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        self.pod_exists(id).await
    }

    async fn all_pods(&self) -> Result<Vec<(PodConfig, PodState)>, EngineError> {
        self.check_open()?;
        let rows =
            sqlx::query("SELECT c.JSON, s.JSON FROM PodConfig c JOIN PodState s ON c.ID = s.ID")
                .fetch_all(&self.pool)
                .await?;
        let mut out = Vec::new();
        for row in rows {
            out.push((
                serde_json::from_str(&row.get::<String, _>(0))?,
                serde_json::from_str(&row.get::<String, _>(1))?,
            ));
        }
        Ok(out)
    }

    async fn lookup_pod_id(&self, id_or_name: &str) -> Result<String, EngineError> {
        self.check_open()?;
        if self.pod_exists(id_or_name).await? {
            return Ok(id_or_name.to_string());
        }
        if let Some(row) = sqlx::query("SELECT ID FROM PodConfig WHERE Name = ?")
            .bind(id_or_name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get(0));
        }
        let ids: Vec<String> = sqlx::query("SELECT ID FROM PodConfig")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();
        match match_prefix(ids, id_or_name) {
            PrefixMatch::Unique(id) => Ok(id),
            PrefixMatch::Ambiguous => Err(EngineError::PodExists(format!(
                "more than one result for pod ID prefix {}",
                id_or_name
            ))),
            PrefixMatch::None => Err(EngineError::NoSuchPod(id_or_name.to_string())),
        }
    }

    async fn pod_containers(&self, id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        if !self.pod_exists(id).await? {
            return Err(EngineError::NoSuchPod(id.to_string()));
        }
        Ok(sqlx::query("SELECT ID FROM ContainerConfig WHERE PodID = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect())
    }

    async fn add_volume(
        &self,
        config: &VolumeConfig,
        state: &VolumeState,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        if sqlx::query("SELECT 1 FROM VolumeConfig WHERE Name = ?")
            .bind(&config.name)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            return Err(EngineError::VolumeExists(config.name.clone()));
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO VolumeConfig (Name, StorageID, JSON) VALUES (?, ?, ?)")
            .bind(&config.name)
            .bind(&config.storage_id)
            .bind(serde_json::to_string(config)?)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO VolumeState (Name, JSON) VALUES (?, ?)")
            .bind(&config.name)
            .bind(serde_json::to_string(state)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.has_volume(name).await? {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        let users = self.volume_users(name).await?;
        if !users.is_empty() {
            return Err(EngineError::VolumeBeingUsed {
                name: name.to_string(),
                users: users.join(", "),
            });
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM VolumeState WHERE Name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM VolumeConfig WHERE Name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn volume_state(&self, name: &str) -> Result<VolumeState, EngineError> {
        self.check_open()?;
        if !self.has_volume(name).await? {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        // State may be absent in old records; treat as the zero value.
        match sqlx::query("SELECT JSON FROM VolumeState WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(serde_json::from_str(&row.get::<String, _>(0))?),
            None => Ok(VolumeState::default()),
        }
    }

    async fn save_volume(&self, name: &str, state: &VolumeState) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.has_volume(name).await? {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        sqlx::query("INSERT OR REPLACE INTO VolumeState (Name, JSON) VALUES (?, ?)")
            .bind(name)
            .bind(serde_json::to_string(state)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn volume_config(&self, name: &str) -> Result<VolumeConfig, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT JSON FROM VolumeConfig WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchVolume(name.to_string()))?;
        Ok(serde_json::from_str(&row.get::<String, _>(0))?)
    }

    async fn has_volume(&self, name: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        Ok(sqlx::query("SELECT 1 FROM VolumeConfig WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    async fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeState)>, EngineError> {
        self.check_open()?;
        let rows = sqlx::query(
            "SELECT c.JSON, s.JSON FROM VolumeConfig c LEFT JOIN VolumeState s ON c.Name = s.Name",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let config: VolumeConfig = serde_json::from_str(&row.get::<String, _>(0))?;
            let state = match row.try_get::<String, _>(1) {
                Ok(json) => serde_json::from_str(&json)?,
                Err(_) => VolumeState::default(),
            };
            out.push((config, state));
        }
        Ok(out)
    }

    async fn volume_users(&self, name: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        Ok(
            sqlx::query("SELECT ContainerID FROM ContainerVolume WHERE VolumeName = ?")
                .bind(name)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect(),
        )
    }

    async fn add_container_exit_code(&self, id: &str, code: i32) -> Result<(), EngineError> {
        self.check_open()?;
        check_exit_code(code)?;
        sqlx::query(
            "INSERT OR REPLACE INTO ContainerExitCode (ID, Timestamp, ExitCode) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(now_unix())
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn container_exit_code(&self, id: &str) -> Result<i32, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT ExitCode FROM ContainerExitCode WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchExitCode(id.to_string()))?;
        Ok(row.get(0))
    }

    async fn prune_container_exit_codes(&self, cutoff: i64) -> Result<(), EngineError> {
        self.check_open()?;
        sqlx::query("DELETE FROM ContainerExitCode WHERE Timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn network_connect(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let mut config = self.load_ctr_config(id).await?;
        if config.networks.contains_key(network) {
            return Err(EngineError::NetworkConnected {
                ctr: id.to_string(),
                network: network.to_string(),
            });
        }
        config.networks.insert(network.to_string(), opts.clone());
        self.save_ctr_config(&config).await
    }

    async fn network_disconnect(&self, id: &str, network: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let mut config = self.load_ctr_config(id).await?;
        if config.networks.remove(network).is_none() {
            return Err(EngineError::NoSuchNetwork(network.to_string()));
        }
        self.save_ctr_config(&config).await
    }

    async fn network_modify(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let mut config = self.load_ctr_config(id).await?;
        if !config.networks.contains_key(network) {
            return Err(EngineError::NoSuchNetwork(network.to_string()));
        }
        config.networks.insert(network.to_string(), opts.clone());
        self.save_ctr_config(&config).await
    }

    async fn container_networks(
        &self,
        id: &str,
    ) -> Result<HashMap<String, PerNetworkOptions>, EngineError> {
        self.check_open()?;
        Ok(self.load_ctr_config(id).await?.networks)
    }

    async fn add_exec_session(&self, session: &ExecSession) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.ctr_exists(&session.container_id).await? {
            return Err(EngineError::NoSuchCtr(session.container_id.clone()));
        }
        if sqlx::query("SELECT 1 FROM ContainerExecSession WHERE ID = ?")
            .bind(&session.id)
            .fetch_optional(&self.pool)
            .await?
            .is_some()
        {
            return Err(EngineError::Internal(format!(
                "exec session ID {} is in use",
                session.id
            )));
        }
        sqlx::query("INSERT INTO ContainerExecSession (ID, ContainerID, JSON) VALUES (?, ?, ?)")
            .bind(&session.id)
            .bind(&session.container_id)
            .bind(serde_json::to_string(session)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn exec_session(&self, id: &str) -> Result<ExecSession, EngineError> {
        self.check_open()?;
        let row = sqlx::query("SELECT JSON FROM ContainerExecSession WHERE ID = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NoSuchExecSession(id.to_string()))?;
        Ok(serde_json::from_str(&row.get::<String, _>(0))?)
    }

    async fn save_exec_session(&self, session: &ExecSession) -> Result<(), EngineError> {
        self.check_open()?;
        let result = sqlx::query("UPDATE ContainerExecSession SET JSON = ? WHERE ID = ?")
            .bind(serde_json::to_string(session)?)
            .bind(&session.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchExecSession(session.id.clone()));
        }
        Ok(())
    }

    async fn remove_exec_session(&self, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let result = sqlx::query("DELETE FROM ContainerExecSession WHERE ID = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchExecSession(id.to_string()));
        }
        Ok(())
    }

    async fn container_exec_sessions(&self, ctr_id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        Ok(
            sqlx::query("SELECT ID FROM ContainerExecSession WHERE ContainerID = ?")
                .bind(ctr_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect(),
        )
    }

    async fn remove_container_exec_sessions(&self, ctr_id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        sqlx::query("DELETE FROM ContainerExecSession WHERE ContainerID = ?")
            .bind(ctr_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_lock_ids(&self) -> Result<Vec<(String, String, locks::LockId)>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        let rows = sqlx::query("SELECT ID, JSON FROM ContainerConfig")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let config: ContainerConfig = serde_json::from_str(&row.get::<String, _>(1))?;
            out.push(("container".to_string(), row.get(0), config.lock_id));
        }
        let rows = sqlx::query("SELECT ID, JSON FROM PodConfig")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let config: PodConfig = serde_json::from_str(&row.get::<String, _>(1))?;
            out.push(("pod".to_string(), row.get(0), config.lock_id));
        }
        let rows = sqlx::query("SELECT Name, JSON FROM VolumeConfig")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let config: VolumeConfig = serde_json::from_str(&row.get::<String, _>(1))?;
            out.push(("volume".to_string(), row.get(0), config.lock_id));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ContainerStatus;
    use crate::util::new_id;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqlState {
        SqlState::open(dir.path()).await.unwrap()
    }

    fn ctr(name: &str) -> (ContainerConfig, ContainerState) {
        (
            ContainerConfig {
                id: new_id(),
                name: name.to_string(),
                lock_id: 1,
                ..Default::default()
            },
            ContainerState::default(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_and_prefix_lookup() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let (config, state) = ctr("db");

        store.add_container(&config, &state).await.unwrap();
        assert_eq!(store.lookup_container_id("db").await.unwrap(), config.id);
        assert_eq!(
            store.lookup_container_id(&config.id[..10]).await.unwrap(),
            config.id
        );
        let loaded = store.container_config(&config.id).await.unwrap();
        assert_eq!(loaded.name, "db");

        store.remove_container(&config.id).await.unwrap();
        assert!(matches!(
            store.lookup_container_id("db").await,
            Err(EngineError::NoSuchCtr(_))
        ));
    }

    #[tokio::test]
    async fn test_id_namespace_shared_with_pods() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let pod = PodConfig {
            id: new_id(),
            name: "taken".to_string(),
            ..Default::default()
        };
        store.add_pod(&pod, &PodState::default()).await.unwrap();

        let (mut config, state) = ctr("other");
        config.id = pod.id.clone();
        assert!(matches!(
            store.add_container(&config, &state).await,
            Err(EngineError::PodExists(_))
        ));

        let (config, state) = ctr("taken");
        assert!(matches!(
            store.add_container(&config, &state).await,
            Err(EngineError::PodExists(_))
        ));
    }

    #[tokio::test]
    async fn test_dependents_block_removal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let (base, base_state) = ctr("base");
        store.add_container(&base, &base_state).await.unwrap();

        let (mut dep, dep_state) = ctr("dep");
        dep.dependencies = vec![base.id.clone()];
        store.add_container(&dep, &dep_state).await.unwrap();

        assert!(matches!(
            store.remove_container(&base.id).await,
            Err(EngineError::DepExists { .. })
        ));
        store.remove_container(&dep.id).await.unwrap();
        store.remove_container(&base.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_membership_via_column() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let pod = PodConfig {
            id: new_id(),
            name: "p".to_string(),
            ..Default::default()
        };
        store.add_pod(&pod, &PodState::default()).await.unwrap();

        let (mut member, state) = ctr("m");
        member.pod_id = Some(pod.id.clone());
        store
            .add_container_to_pod(&pod.id, &member, &state)
            .await
            .unwrap();

        assert_eq!(
            store.pod_containers(&pod.id).await.unwrap(),
            vec![member.id.clone()]
        );
        assert!(store.remove_pod(&pod.id).await.is_err());
        store
            .remove_container_from_pod(&pod.id, &member.id)
            .await
            .unwrap();
        store.remove_pod(&pod.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_network_rows_in_config() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let (config, state) = ctr("net");
        store.add_container(&config, &state).await.unwrap();

        let opts = PerNetworkOptions {
            interface_name: "eth0".to_string(),
            ..Default::default()
        };
        store
            .network_connect(&config.id, "bridge", &opts)
            .await
            .unwrap();
        assert!(matches!(
            store.network_connect(&config.id, "bridge", &opts).await,
            Err(EngineError::NetworkConnected { .. })
        ));

        let networks = store.container_networks(&config.id).await.unwrap();
        assert_eq!(networks["bridge"].interface_name, "eth0");

        store
            .network_disconnect(&config.id, "bridge")
            .await
            .unwrap();
        assert!(matches!(
            store.network_disconnect(&config.id, "bridge").await,
            Err(EngineError::NoSuchNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_code_prune() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.add_container_exit_code("gone", 7).await.unwrap();
        assert_eq!(store.container_exit_code("gone").await.unwrap(), 7);

        store
            .prune_container_exit_codes(now_unix() + 5)
            .await
            .unwrap();
        assert!(matches!(
            store.container_exit_code("gone").await,
            Err(EngineError::NoSuchExitCode(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_resets_and_clears_exec() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let (config, _) = ctr("r");
        let state = ContainerState {
            state: ContainerStatus::Running,
            pid: 77,
            ..Default::default()
        };
        store.add_container(&config, &state).await.unwrap();
        let session = ExecSession {
            id: new_id(),
            container_id: config.id.clone(),
            ..Default::default()
        };
        store.add_exec_session(&session).await.unwrap();

        store.refresh().await.unwrap();
        let state = store.container_state(&config.id).await.unwrap();
        assert_eq!(state.state, ContainerStatus::Configured);
        assert!(store
            .container_exec_sessions(&config.id)
            .await
            .unwrap()
            .is_empty());
    }
}

//! SQLite store and append-only event log.
//!
//! Persists projects, protocol runs, step runs, and events. All
//! multi-field mutations are single statements, so concurrent status
//! updates serialize through SQLite and readers observe a total order of
//! transitions per run.

use chrono::{DateTime, Utc};
use flow_core::types::{Event, Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus, StepType};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(i64),
    #[error("protocol run not found: {0}")]
    ProtocolRunNotFound(i64),
    #[error("step run not found: {0}")]
    StepRunNotFound(i64),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound(_) | Self::ProtocolRunNotFound(_) | Self::StepRunNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// New-project parameters for [`Storage::create_project`].
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub ci_provider: Option<String>,
    pub secrets: Option<BTreeMap<String, Value>>,
    pub default_models: Option<BTreeMap<String, String>>,
}

/// New-run parameters for [`Storage::create_protocol_run`].
#[derive(Debug, Clone)]
pub struct NewProtocolRun {
    pub project_id: i64,
    pub protocol_name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub protocol_root: Option<String>,
    pub description: Option<String>,
    pub template_config: Option<Value>,
    pub template_source: Option<String>,
}

/// New-step parameters for [`Storage::create_step_run`].
#[derive(Debug, Clone)]
pub struct NewStepRun {
    pub protocol_run_id: i64,
    pub step_index: i64,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    pub policy: Option<Value>,
    pub summary: Option<String>,
}

/// Partial step update; `None` fields keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub retries: Option<i64>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    pub runtime_state: Option<Value>,
}

/// Storage backend for the orchestrator.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) a SQLite database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        Self::from_url(&db_url).await
    }

    /// Open a database from a sqlx URL.
    pub async fn from_url(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded migrations in order. Idempotent: duplicate
    /// column / already-exists errors are ignored.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Project operations ---

    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        let now = Utc::now().timestamp_millis();
        let secrets = new.secrets.as_ref().map(serde_json::to_string).transpose()?;
        let default_models = new
            .default_models
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO projects (name, git_url, base_branch, ci_provider, secrets,
                                  default_models, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&new.name)
        .bind(&new.git_url)
        .bind(&new.base_branch)
        .bind(&new.ci_provider)
        .bind(secrets)
        .bind(default_models)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_project(result.last_insert_rowid()).await
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::ProjectNotFound(id))?;
        Ok(row.into_project())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows =
            sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(ProjectRow::into_project).collect())
    }

    // --- Protocol run operations ---

    pub async fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        let now = Utc::now().timestamp_millis();
        let template_config = new
            .template_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO protocol_runs (project_id, protocol_name, status, base_branch,
                                       worktree_path, protocol_root, description,
                                       template_config, template_source, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(new.project_id)
        .bind(&new.protocol_name)
        .bind(new.status.as_str())
        .bind(&new.base_branch)
        .bind(&new.worktree_path)
        .bind(&new.protocol_root)
        .bind(&new.description)
        .bind(template_config)
        .bind(&new.template_source)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_protocol_run(result.last_insert_rowid()).await
    }

    pub async fn get_protocol_run(&self, id: i64) -> Result<ProtocolRun> {
        let row =
            sqlx::query_as::<_, ProtocolRunRow>("SELECT * FROM protocol_runs WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(StorageError::ProtocolRunNotFound(id))?;
        Ok(row.into_run())
    }

    pub async fn list_protocol_runs(&self, project_id: i64) -> Result<Vec<ProtocolRun>> {
        let rows = sqlx::query_as::<_, ProtocolRunRow>(
            "SELECT * FROM protocol_runs WHERE project_id = ?1 ORDER BY created_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProtocolRunRow::into_run).collect())
    }

    pub async fn update_protocol_status(
        &self,
        id: i64,
        status: ProtocolStatus,
    ) -> Result<ProtocolRun> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE protocol_runs SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ProtocolRunNotFound(id));
        }
        self.get_protocol_run(id).await
    }

    pub async fn update_protocol_template(
        &self,
        id: i64,
        template_config: &Value,
        template_source: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let serialized = serde_json::to_string(template_config)?;
        let result = sqlx::query(
            "UPDATE protocol_runs SET template_config = ?1, \
             template_source = COALESCE(?2, template_source), updated_at = ?3 WHERE id = ?4",
        )
        .bind(serialized)
        .bind(template_source)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ProtocolRunNotFound(id));
        }
        Ok(())
    }

    pub async fn update_protocol_paths(
        &self,
        id: i64,
        worktree_path: &str,
        protocol_root: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE protocol_runs SET worktree_path = ?1, protocol_root = ?2, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(worktree_path)
        .bind(protocol_root)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ProtocolRunNotFound(id));
        }
        Ok(())
    }

    /// Locate a protocol run from CI branch/ref notation.
    ///
    /// Accepts `refs/heads/<x>`, `refs/tags/<x>`, bare names, and
    /// `<prefix>/<name>` forms. Candidate segments are tried
    /// longest-to-shortest against `protocol_name` or `base_branch`.
    pub async fn find_protocol_run_by_branch(&self, reference: &str) -> Result<Option<ProtocolRun>> {
        let stripped = reference
            .strip_prefix("refs/heads/")
            .or_else(|| reference.strip_prefix("refs/tags/"))
            .unwrap_or(reference);
        if stripped.is_empty() {
            return Ok(None);
        }

        let mut candidates = vec![stripped.to_string()];
        let mut rest = stripped;
        while let Some((_, suffix)) = rest.split_once('/') {
            candidates.push(suffix.to_string());
            rest = suffix;
        }

        for candidate in candidates {
            let row = sqlx::query_as::<_, ProtocolRunRow>(
                "SELECT * FROM protocol_runs WHERE protocol_name = ?1 OR base_branch = ?1 \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(&candidate)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(row.into_run()));
            }
        }
        Ok(None)
    }

    // --- Step run operations ---

    pub async fn create_step_run(&self, new: NewStepRun) -> Result<StepRun> {
        let now = Utc::now().timestamp_millis();
        let policy = new.policy.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO step_runs (protocol_run_id, step_index, step_name, step_type,
                                   status, retries, model, engine_id, policy, summary,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(new.protocol_run_id)
        .bind(new.step_index)
        .bind(&new.step_name)
        .bind(new.step_type.as_str())
        .bind(new.status.as_str())
        .bind(&new.model)
        .bind(&new.engine_id)
        .bind(policy)
        .bind(&new.summary)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_step_run(result.last_insert_rowid()).await
    }

    pub async fn get_step_run(&self, id: i64) -> Result<StepRun> {
        let row = sqlx::query_as::<_, StepRunRow>("SELECT * FROM step_runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::StepRunNotFound(id))?;
        Ok(row.into_step())
    }

    pub async fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>> {
        let rows = sqlx::query_as::<_, StepRunRow>(
            "SELECT * FROM step_runs WHERE protocol_run_id = ?1 ORDER BY step_index ASC",
        )
        .bind(protocol_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StepRunRow::into_step).collect())
    }

    /// Most recently touched step of a run, if any.
    pub async fn latest_step_run(&self, protocol_run_id: i64) -> Result<Option<StepRun>> {
        let row = sqlx::query_as::<_, StepRunRow>(
            "SELECT * FROM step_runs WHERE protocol_run_id = ?1 \
             ORDER BY updated_at DESC, created_at DESC, id DESC LIMIT 1",
        )
        .bind(protocol_run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StepRunRow::into_step))
    }

    /// Update a step's status, merging only the provided fields; omitted
    /// fields retain their stored values.
    pub async fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        update: StepUpdate,
    ) -> Result<StepRun> {
        let now = Utc::now().timestamp_millis();
        let runtime_state = update
            .runtime_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE step_runs
            SET status = ?1,
                retries = COALESCE(?2, retries),
                summary = COALESCE(?3, summary),
                model = COALESCE(?4, model),
                engine_id = COALESCE(?5, engine_id),
                runtime_state = COALESCE(?6, runtime_state),
                updated_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(status.as_str())
        .bind(update.retries)
        .bind(&update.summary)
        .bind(&update.model)
        .bind(&update.engine_id)
        .bind(runtime_state)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StepRunNotFound(id));
        }
        self.get_step_run(id).await
    }

    // --- Event operations ---

    /// Append an event to the audit log. Events are never updated or
    /// deleted.
    pub async fn append_event(
        &self,
        protocol_run_id: i64,
        step_run_id: Option<i64>,
        event_type: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<Event> {
        let now = Utc::now();
        let metadata_json = metadata.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "INSERT INTO events (protocol_run_id, step_run_id, event_type, message, \
             metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(protocol_run_id)
        .bind(step_run_id)
        .bind(event_type)
        .bind(message)
        .bind(metadata_json)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id: result.last_insert_rowid(),
            protocol_run_id,
            step_run_id,
            event_type: event_type.to_string(),
            message: message.to_string(),
            metadata,
            created_at: now,
        })
    }

    pub async fn list_events(&self, protocol_run_id: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE protocol_run_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(protocol_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

/// Parse a JSON column defensively: malformed content reads as `None`
/// rather than failing the row.
fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    name: String,
    git_url: String,
    base_branch: String,
    ci_provider: Option<String>,
    secrets: Option<String>,
    default_models: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        let secrets = parse_json_column(self.secrets)
            .and_then(|v| serde_json::from_value::<BTreeMap<String, Value>>(v).ok());
        let default_models = parse_json_column(self.default_models)
            .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v).ok());
        Project {
            id: self.id,
            name: self.name,
            git_url: self.git_url,
            base_branch: self.base_branch,
            ci_provider: self.ci_provider,
            secrets,
            default_models,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProtocolRunRow {
    id: i64,
    project_id: i64,
    protocol_name: String,
    status: String,
    base_branch: String,
    worktree_path: Option<String>,
    protocol_root: Option<String>,
    description: Option<String>,
    template_config: Option<String>,
    template_source: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ProtocolRunRow {
    fn into_run(self) -> ProtocolRun {
        ProtocolRun {
            id: self.id,
            project_id: self.project_id,
            protocol_name: self.protocol_name,
            status: ProtocolStatus::parse(&self.status).unwrap_or(ProtocolStatus::Failed),
            base_branch: self.base_branch,
            worktree_path: self.worktree_path,
            protocol_root: self.protocol_root,
            description: self.description,
            template_config: parse_json_column(self.template_config),
            template_source: self.template_source,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRunRow {
    id: i64,
    protocol_run_id: i64,
    step_index: i64,
    step_name: String,
    step_type: String,
    status: String,
    retries: i64,
    model: Option<String>,
    engine_id: Option<String>,
    policy: Option<String>,
    runtime_state: Option<String>,
    summary: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl StepRunRow {
    fn into_step(self) -> StepRun {
        StepRun {
            id: self.id,
            protocol_run_id: self.protocol_run_id,
            step_index: self.step_index,
            step_name: self.step_name,
            step_type: StepType::parse(&self.step_type).unwrap_or(StepType::Work),
            status: StepStatus::parse(&self.status).unwrap_or(StepStatus::Failed),
            retries: self.retries,
            model: self.model,
            engine_id: self.engine_id,
            policy: parse_json_column(self.policy),
            runtime_state: parse_json_column(self.runtime_state),
            summary: self.summary,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    protocol_run_id: i64,
    step_run_id: Option<i64>,
    event_type: String,
    message: String,
    metadata: Option<String>,
    created_at: i64,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: self.id,
            protocol_run_id: self.protocol_run_id,
            step_run_id: self.step_run_id,
            event_type: self.event_type,
            message: self.message,
            metadata: parse_json_column(self.metadata),
            created_at: timestamp(self.created_at),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) struct TestStorage {
        pub storage: std::sync::Arc<Storage>,
        _dir: TempDir,
    }

    pub(crate) async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage {
            storage: std::sync::Arc::new(storage),
            _dir: dir,
        }
    }

    /// Poke a policy list onto an existing step row; policies are set at
    /// materialisation time and the store keeps them opaque.
    pub(crate) async fn set_step_policy(ts: &TestStorage, step_id: i64, policy: &Value) {
        sqlx::query("UPDATE step_runs SET policy = ?1 WHERE id = ?2")
            .bind(policy.to_string())
            .bind(step_id)
            .execute(&ts.storage.pool)
            .await
            .unwrap();
    }

    async fn create_demo_project(storage: &Storage) -> Project {
        storage
            .create_project(NewProject {
                name: "demo".to_string(),
                git_url: "/tmp/demo".to_string(),
                base_branch: "main".to_string(),
                ..NewProject::default()
            })
            .await
            .unwrap()
    }

    async fn create_demo_run(storage: &Storage, project_id: i64) -> ProtocolRun {
        storage
            .create_protocol_run(NewProtocolRun {
                project_id,
                protocol_name: "0001-demo".to_string(),
                status: ProtocolStatus::Pending,
                base_branch: "main".to_string(),
                worktree_path: None,
                protocol_root: None,
                description: Some("demo".to_string()),
                template_config: None,
                template_source: None,
            })
            .await
            .unwrap()
    }

    fn demo_step(protocol_run_id: i64, step_index: i64) -> NewStepRun {
        NewStepRun {
            protocol_run_id,
            step_index,
            step_name: format!("{step_index:02}-step.md"),
            step_type: StepType::Work,
            status: StepStatus::Pending,
            model: None,
            engine_id: None,
            policy: None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_project() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        assert_eq!(project.id, 1);

        let fetched = ts.storage.get_project(project.id).await.unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.base_branch, "main");
    }

    #[tokio::test]
    async fn get_missing_project_is_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_project(99).await;
        assert!(matches!(result, Err(StorageError::ProjectNotFound(99))));
    }

    #[tokio::test]
    async fn protocol_status_round_trips_through_updates() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;
        assert_eq!(run.status, ProtocolStatus::Pending);

        let updated = ts
            .storage
            .update_protocol_status(run.id, ProtocolStatus::Running)
            .await
            .unwrap();
        assert_eq!(updated.status, ProtocolStatus::Running);
        assert!(updated.updated_at >= run.updated_at);

        let fetched = ts.storage.get_protocol_run(run.id).await.unwrap();
        assert_eq!(fetched.status, ProtocolStatus::Running);
    }

    #[tokio::test]
    async fn update_protocol_template_stores_spec() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        let template = serde_json::json!({
            "protocol_spec": {"steps": [{"id": "a", "name": "01-a.md"}]}
        });
        ts.storage
            .update_protocol_template(run.id, &template, Some("planner"))
            .await
            .unwrap();

        let fetched = ts.storage.get_protocol_run(run.id).await.unwrap();
        assert_eq!(fetched.template_config, Some(template));
        assert_eq!(fetched.template_source.as_deref(), Some("planner"));
    }

    #[tokio::test]
    async fn find_run_by_branch_notation_variants() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        for reference in [
            "0001-demo",
            "refs/heads/0001-demo",
            "feature/0001-demo",
            "refs/heads/feature/0001-demo",
            "main",
        ] {
            let found = ts
                .storage
                .find_protocol_run_by_branch(reference)
                .await
                .unwrap();
            assert_eq!(found.map(|r| r.id), Some(run.id), "reference {reference}");
        }

        let missing = ts
            .storage
            .find_protocol_run_by_branch("refs/heads/unrelated")
            .await
            .unwrap();
        assert!(missing.is_none());
        assert!(ts
            .storage
            .find_protocol_run_by_branch("")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn step_index_is_unique_per_run() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        ts.storage.create_step_run(demo_step(run.id, 0)).await.unwrap();
        let duplicate = ts.storage.create_step_run(demo_step(run.id, 0)).await;
        assert!(duplicate.is_err());

        // Same index on a different run is fine.
        let other = create_demo_run(&ts.storage, project.id).await;
        assert!(ts.storage.create_step_run(demo_step(other.id, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn update_step_status_merges_only_provided_fields() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;
        let step = ts.storage.create_step_run(demo_step(run.id, 0)).await.unwrap();

        ts.storage
            .update_step_status(
                step.id,
                StepStatus::Running,
                StepUpdate {
                    summary: Some("executing".to_string()),
                    model: Some("codex-5.1".to_string()),
                    ..StepUpdate::default()
                },
            )
            .await
            .unwrap();

        // A later update without summary/model keeps the stored values.
        let updated = ts
            .storage
            .update_step_status(
                step.id,
                StepStatus::NeedsQa,
                StepUpdate {
                    retries: Some(1),
                    ..StepUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, StepStatus::NeedsQa);
        assert_eq!(updated.summary.as_deref(), Some("executing"));
        assert_eq!(updated.model.as_deref(), Some("codex-5.1"));
        assert_eq!(updated.retries, 1);
    }

    #[tokio::test]
    async fn runtime_state_round_trips() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;
        let step = ts.storage.create_step_run(demo_step(run.id, 0)).await.unwrap();

        let state = serde_json::json!({"loop_iterations": 2});
        ts.storage
            .update_step_status(
                step.id,
                StepStatus::Pending,
                StepUpdate {
                    runtime_state: Some(state.clone()),
                    ..StepUpdate::default()
                },
            )
            .await
            .unwrap();

        let fetched = ts.storage.get_step_run(step.id).await.unwrap();
        assert_eq!(fetched.runtime_state, Some(state));
    }

    #[tokio::test]
    async fn latest_step_run_follows_updates() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        assert!(ts.storage.latest_step_run(run.id).await.unwrap().is_none());

        let first = ts.storage.create_step_run(demo_step(run.id, 0)).await.unwrap();
        let second = ts.storage.create_step_run(demo_step(run.id, 1)).await.unwrap();
        let latest = ts.storage.latest_step_run(run.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        // Touching the first step makes it the latest again.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ts.storage
            .update_step_status(first.id, StepStatus::Running, StepUpdate::default())
            .await
            .unwrap();
        let latest = ts.storage.latest_step_run(run.id).await.unwrap().unwrap();
        assert_eq!(latest.id, first.id);
    }

    #[tokio::test]
    async fn events_append_in_order_with_metadata() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        ts.storage
            .append_event(run.id, None, "planned", "Protocol planned.", None)
            .await
            .unwrap();
        ts.storage
            .append_event(
                run.id,
                None,
                "step_completed",
                "Step executed.",
                Some(serde_json::json!({"spec_hash": "abc123def456"})),
            )
            .await
            .unwrap();

        let events = ts.storage.list_events(run.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "planned");
        assert_eq!(events[1].event_type, "step_completed");
        assert_eq!(
            events[1].metadata.as_ref().unwrap()["spec_hash"],
            "abc123def456"
        );
    }

    #[tokio::test]
    async fn malformed_json_columns_read_as_none() {
        let ts = create_test_storage().await;
        let project = create_demo_project(&ts.storage).await;
        let run = create_demo_run(&ts.storage, project.id).await;

        // Corrupt the column behind the store's back.
        sqlx::query("UPDATE protocol_runs SET template_config = 'not json' WHERE id = ?1")
            .bind(run.id)
            .execute(&ts.storage.pool)
            .await
            .unwrap();

        let fetched = ts.storage.get_protocol_run(run.id).await.unwrap();
        assert!(fetched.template_config.is_none());
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();
        create_demo_project(&storage).await;
    }
}

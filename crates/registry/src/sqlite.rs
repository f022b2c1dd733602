//! SQLite-backed registry.
//!
//! The schema is versioned in a single-row `_schema_version` table and
//! migrations run idempotently on open. Write-ahead logging is enabled and
//! installation/fork writes are upserts so the provisioning pipeline can
//! retry without duplicating rows.

use std::{collections::HashMap, path::Path, str::FromStr};

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeZone, Utc},
    secrecy::{ExposeSecret, Secret},
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
    tracing::{debug, info},
};

use crate::{
    Error, Result,
    model::{GithubFork, GithubInstallation, Node, User, Workspace, WorkspaceRepo},
};

use dockyard_protocol::{NodeStatus, ServiceSpec, WorkspaceStatus};

/// Schema migrations, one entry per version, applied in order inside a
/// transaction. Each statement runs separately; everything here must be
/// re-runnable against a database that already saw an older version.
const MIGRATIONS: &[&[&str]] = &[
    // v1 — initial schema
    &[
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            public_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS github_installations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
            account_id INTEGER NOT NULL,
            account_login TEXT NOT NULL,
            access_token TEXT NOT NULL,
            token_expires_at INTEGER NOT NULL,
            repository_scope TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS github_forks (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            original_owner TEXT NOT NULL,
            original_repo TEXT NOT NULL,
            fork_owner TEXT NOT NULL,
            fork_url TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, original_owner, original_repo)
        )",
        "CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            provider TEXT NOT NULL,
            image TEXT NOT NULL,
            repo_owner TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            repo_url TEXT NOT NULL,
            repo_branch TEXT,
            repo_commit TEXT,
            fork_created INTEGER NOT NULL DEFAULT 0,
            fork_url TEXT,
            ssh_host TEXT,
            ssh_port INTEGER NOT NULL DEFAULT 0,
            node_id TEXT,
            services TEXT NOT NULL DEFAULT '[]',
            service_ports TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            status TEXT NOT NULL,
            version TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '[]',
            labels TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_workspaces_user_id ON workspaces(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_workspaces_status ON workspaces(status)",
        "CREATE INDEX IF NOT EXISTS idx_users_username ON users(username)",
    ],
];

pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (creating if missing) the database at `path`, enable WAL, and
    /// run any pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .min_connections(4)
            .connect_with(options)
            .await?;

        let registry = Self { pool };
        registry.migrate().await?;
        info!(path = %path.display(), "sqlite registry ready");
        Ok(registry)
    }

    /// In-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let current: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM _schema_version")
                .fetch_one(&self.pool)
                .await?;

        let target = MIGRATIONS.len() as i64;
        if current >= target {
            debug!(version = current, "schema up to date");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (idx, statements) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }
            for stmt in *statements {
                sqlx::query(stmt).execute(&mut *tx).await?;
            }
            debug!(version, "applied schema migration");
        }
        sqlx::query(
            "INSERT INTO _schema_version (id, version) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        )
        .bind(target)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(from = current, to = target, "schema migrated");
        Ok(())
    }
}

// ── Row types ────────────────────────────────────────────────────────────────

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    public_key: String,
    created_at: i64,
    updated_at: i64,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.id,
            username: r.username,
            public_key: r.public_key,
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InstallationRow {
    id: String,
    user_id: String,
    account_id: i64,
    account_login: String,
    access_token: String,
    token_expires_at: i64,
    repository_scope: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<InstallationRow> for GithubInstallation {
    fn from(r: InstallationRow) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            account_id: r.account_id,
            account_login: r.account_login,
            access_token: Secret::new(r.access_token),
            token_expires_at: from_ms(r.token_expires_at),
            repository_scope: r.repository_scope,
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ForkRow {
    user_id: String,
    original_owner: String,
    original_repo: String,
    fork_owner: String,
    fork_url: String,
    created_at: i64,
}

impl From<ForkRow> for GithubFork {
    fn from(r: ForkRow) -> Self {
        Self {
            user_id: r.user_id,
            original_owner: r.original_owner,
            original_repo: r.original_repo,
            fork_owner: r.fork_owner,
            fork_url: r.fork_url,
            created_at: from_ms(r.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    user_id: String,
    name: String,
    status: String,
    provider: String,
    image: String,
    repo_owner: String,
    repo_name: String,
    repo_url: String,
    repo_branch: Option<String>,
    repo_commit: Option<String>,
    fork_created: i64,
    fork_url: Option<String>,
    ssh_host: Option<String>,
    ssh_port: i64,
    node_id: Option<String>,
    services: String,
    service_ports: String,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = Error;

    fn try_from(r: WorkspaceRow) -> Result<Self> {
        let services: Vec<ServiceSpec> = serde_json::from_str(&r.services)?;
        let service_ports: HashMap<String, u16> = serde_json::from_str(&r.service_ports)?;
        let status = WorkspaceStatus::from_str(&r.status).map_err(Error::Message)?;
        Ok(Self {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            status,
            provider: r.provider,
            image: r.image,
            repo: WorkspaceRepo {
                owner: r.repo_owner,
                name: r.repo_name,
                url: r.repo_url,
                branch: r.repo_branch,
                commit: r.repo_commit,
            },
            fork_created: r.fork_created != 0,
            fork_url: r.fork_url,
            ssh_host: r.ssh_host,
            ssh_port: r.ssh_port as u16,
            node_id: r.node_id,
            services,
            service_ports,
            error: r.error,
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    name: String,
    host: String,
    port: i64,
    status: String,
    version: String,
    last_seen: i64,
    capabilities: String,
    labels: String,
    metadata: String,
}

impl TryFrom<NodeRow> for Node {
    type Error = Error;

    fn try_from(r: NodeRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            name: r.name,
            host: r.host,
            port: r.port as u16,
            status: NodeStatus::from_str(&r.status).map_err(Error::Message)?,
            version: r.version,
            last_seen: from_ms(r.last_seen),
            capabilities: serde_json::from_str(&r.capabilities)?,
            labels: serde_json::from_str(&r.labels)?,
            metadata: serde_json::from_str(&r.metadata)?,
        })
    }
}

// ── Registry impl ────────────────────────────────────────────────────────────

#[async_trait]
impl crate::Registry for SqliteRegistry {
    async fn register_user(&self, user: User) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO users (id, username, public_key, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.public_key)
        .bind(to_ms(user.created_at))
        .bind(to_ms(user.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::conflict(
                format!("username already registered: {}", user.username),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn remove_user(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_installation(&self, installation: GithubInstallation) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO github_installations
               (id, user_id, account_id, account_login, access_token,
                token_expires_at, repository_scope, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 account_id = excluded.account_id,
                 account_login = excluded.account_login,
                 access_token = excluded.access_token,
                 token_expires_at = excluded.token_expires_at,
                 repository_scope = excluded.repository_scope,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&installation.id)
        .bind(&installation.user_id)
        .bind(installation.account_id)
        .bind(&installation.account_login)
        .bind(installation.access_token.expose_secret())
        .bind(to_ms(installation.token_expires_at))
        .bind(&installation.repository_scope)
        .bind(to_ms(installation.created_at))
        .bind(to_ms(installation.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_installation_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<GithubInstallation>> {
        let row = sqlx::query_as::<_, InstallationRow>(
            "SELECT * FROM github_installations WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete_installation_by_user(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM github_installations WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_fork(&self, fork: GithubFork) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO github_forks
               (user_id, original_owner, original_repo, fork_owner, fork_url, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, original_owner, original_repo) DO UPDATE SET
                 fork_owner = excluded.fork_owner,
                 fork_url = excluded.fork_url"#,
        )
        .bind(&fork.user_id)
        .bind(&fork.original_owner)
        .bind(&fork.original_repo)
        .bind(&fork.fork_owner)
        .bind(&fork.fork_url)
        .bind(to_ms(fork.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fork(
        &self,
        user_id: &str,
        original_owner: &str,
        original_repo: &str,
    ) -> Result<Option<GithubFork>> {
        let row = sqlx::query_as::<_, ForkRow>(
            "SELECT * FROM github_forks
             WHERE user_id = ? AND original_owner = ? AND original_repo = ?",
        )
        .bind(user_id)
        .bind(original_owner)
        .bind(original_repo)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create_workspace(&self, ws: Workspace) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO workspaces
               (id, user_id, name, status, provider, image,
                repo_owner, repo_name, repo_url, repo_branch, repo_commit,
                fork_created, fork_url, ssh_host, ssh_port, node_id,
                services, service_ports, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&ws.id)
        .bind(&ws.user_id)
        .bind(&ws.name)
        .bind(ws.status.to_string())
        .bind(&ws.provider)
        .bind(&ws.image)
        .bind(&ws.repo.owner)
        .bind(&ws.repo.name)
        .bind(&ws.repo.url)
        .bind(&ws.repo.branch)
        .bind(&ws.repo.commit)
        .bind(ws.fork_created as i64)
        .bind(&ws.fork_url)
        .bind(&ws.ssh_host)
        .bind(ws.ssh_port as i64)
        .bind(&ws.node_id)
        .bind(serde_json::to_string(&ws.services)?)
        .bind(serde_json::to_string(&ws.service_ports)?)
        .bind(&ws.error)
        .bind(to_ms(ws.created_at))
        .bind(to_ms(ws.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_workspace_by_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces
             WHERE user_id = ? AND name = ? AND status != 'deleted'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces WHERE status != 'deleted' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_workspaces_by_node(&self, node_id: &str) -> Result<Vec<Workspace>> {
        let rows =
            sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE node_id = ?")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_workspace(&self, ws: Workspace) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE workspaces SET
                 status = ?, provider = ?, image = ?,
                 fork_created = ?, fork_url = ?, ssh_host = ?, ssh_port = ?,
                 node_id = ?, services = ?, service_ports = ?, error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(ws.status.to_string())
        .bind(&ws.provider)
        .bind(&ws.image)
        .bind(ws.fork_created as i64)
        .bind(&ws.fork_url)
        .bind(&ws.ssh_host)
        .bind(ws.ssh_port as i64)
        .bind(&ws.node_id)
        .bind(serde_json::to_string(&ws.services)?)
        .bind(serde_json::to_string(&ws.service_ports)?)
        .bind(&ws.error)
        .bind(to_ms(ws.updated_at))
        .bind(&ws.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("workspace", &ws.id));
        }
        Ok(())
    }

    async fn upsert_node(&self, node: Node) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO nodes
               (id, name, host, port, status, version, last_seen, capabilities, labels, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 host = excluded.host,
                 port = excluded.port,
                 status = excluded.status,
                 version = excluded.version,
                 last_seen = excluded.last_seen,
                 capabilities = excluded.capabilities,
                 labels = excluded.labels,
                 metadata = excluded.metadata"#,
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(&node.host)
        .bind(node.port as i64)
        .bind(node.status.to_string())
        .bind(&node.version)
        .bind(to_ms(node.last_seen))
        .bind(serde_json::to_string(&node.capabilities)?)
        .bind(serde_json::to_string(&node.labels)?)
        .bind(serde_json::to_string(&node.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn remove_node(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_nodes_by_capability(&self, capability: &str) -> Result<Vec<Node>> {
        // Capability lists are small JSON arrays; filter after decode.
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.has_capability(capability))
            .collect())
    }

    async fn list_nodes_by_label(&self, key: &str, value: &str) -> Result<Vec<Node>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.labels.get(key).map(String::as_str) == Some(value))
            .collect())
    }
}

impl SqliteRegistry {
    /// Number of workspaces in `running` or `provisioning` on a node, for
    /// scheduler load tie-breaking.
    pub async fn count_live_by_node(&self, node_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query(
            "SELECT COALESCE(COUNT(*), 0) AS n FROM workspaces
             WHERE node_id = ? AND status IN ('provisioning', 'running')",
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(count)
    }
}

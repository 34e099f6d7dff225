use async_trait::async_trait;
use dashmap::DashMap;
use iv_core::types::{Incident, IncidentId, Organization, OrgId, WorkspaceId, now_millis};
use sqlx::pool::PoolConnection;
use sqlx::{Pool, Postgres, Row};
use std::collections::BTreeSet;
use visibility::{VisibilityError, VisibilityResult, VisibilityStore};
use visibility::traits::OrgHierarchy;

fn storage_err(e: sqlx::Error) -> VisibilityError {
    VisibilityError::Storage(e.to_string())
}

fn decode_err(e: anyhow::Error) -> VisibilityError {
    VisibilityError::Storage(format!("invalid row value: {e}"))
}

/// Postgres adapter implementing both `VisibilityStore` and `OrgHierarchy`.
///
/// Per-incident serialization uses session advisory locks held on a
/// dedicated pooled connection. The connection is parked in `lock_conns`
/// between `lock_incident` and `unlock_incident` so lock and unlock run on
/// the same session.
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    lock_conns: DashMap<String, PoolConnection<Postgres>>,
}

impl PostgresBackend {
    pub async fn new(connection_url: &str) -> VisibilityResult<Self> {
        let pool = Pool::connect(connection_url).await.map_err(storage_err)?;
        Ok(Self {
            pool,
            lock_conns: DashMap::new(),
        })
    }

    pub async fn initialize_schema(&self) -> VisibilityResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_organizations_workspace_id
             ON organizations(workspace_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Edge table: the hierarchy is a DAG, an org may have several
        // parents.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS organization_parents (
                org_id TEXT NOT NULL REFERENCES organizations(id),
                parent_id TEXT NOT NULL REFERENCES organizations(id),
                PRIMARY KEY (org_id, parent_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_organization_parents_parent_id
             ON organization_parents(parent_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                name TEXT,
                workspace_id TEXT NOT NULL,
                owner_org_id TEXT NOT NULL REFERENCES organizations(id),
                created_at BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS incident_org_mappings (
                incident_id TEXT NOT NULL REFERENCES incidents(id),
                org_id TEXT NOT NULL REFERENCES organizations(id),
                created_at BIGINT NOT NULL,
                PRIMARY KEY (incident_id, org_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    pub async fn create_org(&self, org: &Organization) -> VisibilityResult<()> {
        sqlx::query(
            "INSERT INTO organizations (id, name, workspace_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(org.id.as_str())
        .bind(&org.name)
        .bind(org.workspace_id.as_str())
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for parent in &org.parent_ids {
            sqlx::query(
                "INSERT INTO organization_parents (org_id, parent_id)
                 VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(org.id.as_str())
            .bind(parent.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        }

        Ok(())
    }

    pub async fn create_incident(&self, incident: &Incident) -> VisibilityResult<()> {
        sqlx::query(
            "INSERT INTO incidents (id, name, workspace_id, owner_org_id, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(incident.id.as_str())
        .bind(&incident.name)
        .bind(incident.workspace_id.as_str())
        .bind(incident.owner_org_id.as_str())
        .bind(incident.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

#[async_trait]
impl OrgHierarchy for PostgresBackend {
    async fn get_parents(&self, org_id: &OrgId) -> VisibilityResult<BTreeSet<OrgId>> {
        // UNION (not UNION ALL) so diamond-shaped ancestry terminates.
        let rows = sqlx::query(
            "WITH RECURSIVE ancestors AS (
                SELECT parent_id FROM organization_parents WHERE org_id = $1
                UNION
                SELECT p.parent_id
                FROM organization_parents p
                INNER JOIN ancestors a ON p.org_id = a.parent_id
            )
            SELECT parent_id FROM ancestors",
        )
        .bind(org_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut parents = BTreeSet::new();
        for row in rows {
            let id: String = row.get("parent_id");
            parents.insert(id.parse().map_err(decode_err)?);
        }
        Ok(parents)
    }

    async fn get_children(&self, org_ids: &BTreeSet<OrgId>) -> VisibilityResult<BTreeSet<OrgId>> {
        let roots: Vec<String> = org_ids.iter().map(|o| o.as_str().to_string()).collect();
        let rows = sqlx::query(
            "WITH RECURSIVE descendants AS (
                SELECT org_id FROM organization_parents WHERE parent_id = ANY($1)
                UNION
                SELECT p.org_id
                FROM organization_parents p
                INNER JOIN descendants d ON p.parent_id = d.org_id
            )
            SELECT org_id FROM descendants",
        )
        .bind(&roots)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut children = BTreeSet::new();
        for row in rows {
            let id: String = row.get("org_id");
            children.insert(id.parse().map_err(decode_err)?);
        }
        Ok(children)
    }
}

#[async_trait]
impl VisibilityStore for PostgresBackend {
    async fn get_incident(&self, incident_id: &IncidentId) -> VisibilityResult<Incident> {
        let row = sqlx::query(
            "SELECT id, name, workspace_id, owner_org_id, created_at
             FROM incidents WHERE id = $1",
        )
        .bind(incident_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Err(VisibilityError::IncidentNotFound(
                incident_id.as_str().to_string(),
            ));
        };

        Ok(Incident {
            id: row.get::<String, _>("id").parse().map_err(decode_err)?,
            name: row.get("name"),
            workspace_id: row
                .get::<String, _>("workspace_id")
                .parse()
                .map_err(decode_err)?,
            owner_org_id: row
                .get::<String, _>("owner_org_id")
                .parse()
                .map_err(decode_err)?,
            created_at: row.get("created_at"),
        })
    }

    async fn get_mappings(&self, incident_id: &IncidentId) -> VisibilityResult<BTreeSet<OrgId>> {
        let rows = sqlx::query("SELECT org_id FROM incident_org_mappings WHERE incident_id = $1")
            .bind(incident_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut mappings = BTreeSet::new();
        for row in rows {
            let id: String = row.get("org_id");
            mappings.insert(id.parse().map_err(decode_err)?);
        }
        Ok(mappings)
    }

    async fn add_mapping(&self, incident_id: &IncidentId, org_id: &OrgId) -> VisibilityResult<()> {
        sqlx::query(
            "INSERT INTO incident_org_mappings (incident_id, org_id, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (incident_id, org_id) DO NOTHING",
        )
        .bind(incident_id.as_str())
        .bind(org_id.as_str())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn remove_mapping(
        &self,
        incident_id: &IncidentId,
        org_id: &OrgId,
    ) -> VisibilityResult<()> {
        sqlx::query("DELETE FROM incident_org_mappings WHERE incident_id = $1 AND org_id = $2")
            .bind(incident_id.as_str())
            .bind(org_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn list_workspace_orgs(
        &self,
        workspace_id: &WorkspaceId,
    ) -> VisibilityResult<BTreeSet<OrgId>> {
        let rows = sqlx::query("SELECT id FROM organizations WHERE workspace_id = $1")
            .bind(workspace_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut orgs = BTreeSet::new();
        for row in rows {
            let id: String = row.get("id");
            orgs.insert(id.parse().map_err(decode_err)?);
        }
        Ok(orgs)
    }

    async fn lock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        // Session-scoped advisory lock; must be released on the same
        // connection, which is parked until unlock_incident.
        sqlx::query("SELECT pg_advisory_lock(hashtextextended($1, 0))")
            .bind(incident_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        tracing::debug!(incident_id = %incident_id, "Acquired incident advisory lock");
        self.lock_conns
            .insert(incident_id.as_str().to_string(), conn);
        Ok(())
    }

    async fn unlock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()> {
        let Some((_, mut conn)) = self.lock_conns.remove(incident_id.as_str()) else {
            return Err(VisibilityError::Storage(format!(
                "no lock held for incident {incident_id}"
            )));
        };

        sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
            .bind(incident_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        Ok(())
    }
}

//! Tenant context resolution. A `TenantContext` is the only handle through
//! which the engine reaches the database: it pins every query to one
//! organization's partition, so no component ever takes a raw org id.

use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;

use shared::{EngineError, EngineResult, Role, WorkflowSettings};

use crate::models::{NewTenantAccessAudit, User, WorkflowSettingsRow};
use crate::schema::{organizations, tenant_access_audit, users, workflow_settings};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConn<'a> = PooledConnection<'a, AsyncPgConnection>;

pub(crate) async fn get_conn(pool: &DbPool) -> EngineResult<DbConn<'_>> {
    pool.get()
        .await
        .map_err(|e| EngineError::Pool(e.to_string()))
}

#[derive(Debug)]
pub struct TenantContext {
    pool: DbPool,
    org_id: Uuid,
    user_id: Uuid,
    role: Role,
}

impl TenantContext {
    /// Resolves the principal to its own organization. Fails closed when the
    /// user or its organization does not exist.
    pub async fn resolve(pool: &DbPool, principal_user_id: Uuid) -> EngineResult<Self> {
        let mut conn = get_conn(pool).await?;

        let user = users::table
            .filter(users::id.eq(principal_user_id))
            .first::<User>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| EngineError::not_found("user", principal_user_id))?;

        let org_exists: i64 = organizations::table
            .filter(organizations::id.eq(user.org_id))
            .count()
            .get_result(&mut conn)
            .await?;
        if org_exists == 0 {
            return Err(EngineError::not_found("tenant", user.org_id));
        }

        Ok(Self {
            pool: pool.clone(),
            org_id: user.org_id,
            user_id: user.id,
            role: Role::parse(&user.role).unwrap_or(Role::Member),
        })
    }

    /// Grants an administrator a handle bound to a different tenant. The
    /// audit row is written in the same transaction that validates the grant,
    /// so the handle cannot exist without its audit trail.
    pub async fn resolve_for_org(
        pool: &DbPool,
        principal_user_id: Uuid,
        target_org_id: Uuid,
        operation: &str,
    ) -> EngineResult<Self> {
        let ctx = Self::resolve(pool, principal_user_id).await?;
        if ctx.org_id == target_org_id {
            return Ok(ctx);
        }
        if ctx.role != Role::Admin {
            return Err(EngineError::Forbidden(
                "cross-tenant access requires the admin role".into(),
            ));
        }

        let mut conn = get_conn(pool).await?;
        let operation = operation.to_string();
        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                let target_exists: i64 = organizations::table
                    .filter(organizations::id.eq(target_org_id))
                    .count()
                    .get_result(conn)
                    .await?;
                if target_exists == 0 {
                    return Err(EngineError::not_found("tenant", target_org_id));
                }

                diesel::insert_into(tenant_access_audit::table)
                    .values(&NewTenantAccessAudit {
                        id: Uuid::new_v4(),
                        actor_user_id: principal_user_id,
                        target_org_id,
                        operation,
                    })
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await?;

        info!(
            "cross-tenant access granted: user {} -> org {}",
            principal_user_id, target_org_id
        );

        Ok(Self {
            pool: pool.clone(),
            org_id: target_org_id,
            user_id: principal_user_id,
            role: Role::Admin,
        })
    }

    /// Binding used by background jobs, which act per organization without a
    /// principal. Never reachable from the HTTP surface.
    pub fn for_system(pool: &DbPool, org_id: Uuid) -> Self {
        Self {
            pool: pool.clone(),
            org_id,
            user_id: Uuid::nil(),
            role: Role::Admin,
        }
    }

    pub async fn conn(&self) -> EngineResult<DbConn<'_>> {
        get_conn(&self.pool).await
    }

    pub fn org_id(&self) -> Uuid {
        self.org_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> EngineResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("admin role required".into()))
        }
    }

    /// Per-tenant workflow knobs; defaults apply until the organization has
    /// saved its own row.
    pub async fn workflow_settings(&self) -> EngineResult<WorkflowSettings> {
        let mut conn = self.conn().await?;
        let row = workflow_settings::table
            .filter(workflow_settings::org_id.eq(self.org_id))
            .first::<WorkflowSettingsRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(WorkflowSettingsRow::into_settings).unwrap_or_default())
    }
}

pub async fn organization_ids(pool: &DbPool) -> EngineResult<Vec<Uuid>> {
    let mut conn = get_conn(pool).await?;
    let ids = organizations::table
        .select(organizations::id)
        .load::<Uuid>(&mut conn)
        .await?;
    Ok(ids)
}

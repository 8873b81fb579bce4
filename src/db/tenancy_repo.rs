// src/db/tenancy_repo.rs

use sqlx::{PgPool, Postgres, Executor};
use uuid::Uuid;
use crate::common::error::AppError;
use crate::models::tenancy::{Produto, Tenant};

#[derive(Clone)]
pub struct TenantRepository {
    pool: PgPool,
}

impl TenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_tenant<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Option<Tenant>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(executor)
            .await?;

        Ok(tenant)
    }

    /// Todos os tenants não apagados (o auditor percorre um por um).
    pub async fn list_live_tenants(&self) -> Result<Vec<Tenant>, AppError> {
        let tenants = sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE status <> 'deleted' ORDER BY slug ASC",
        )
            .fetch_all(&self.pool)
            .await?;

        Ok(tenants)
    }

    pub async fn find_produto<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Option<Produto>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let produto = sqlx::query_as::<_, Produto>(
            "SELECT * FROM produtos WHERE id = $1 AND tenant_id = $2",
        )
            .bind(produto_id)
            .bind(tenant_id)
            .fetch_optional(executor)
            .await?;

        Ok(produto)
    }
}

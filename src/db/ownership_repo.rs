// src/db/ownership_repo.rs

use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;
use crate::{common::error::AppError, models::ownership::EntityKind};

#[derive(Clone)]
pub struct OwnershipRepository {
    pool: PgPool,
}

impl OwnershipRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lê apenas a coluna tenant_id da entidade.
    /// `None` = linha não existe; `Some(None)` = linha existe mas sem tenant.
    pub async fn find_tenant_of<'e, E>(
        &self,
        executor: E,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<Option<Uuid>>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        // Via função SECURITY DEFINER: sob RLS, a linha de outro tenant precisa
        // aparecer como posse divergente, não como inexistente.
        let tenant = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT tenant_id FROM tenant_do_registro($1, $2)",
        )
            .bind(kind.table())
            .bind(id)
            .fetch_optional(executor)
            .await?;

        Ok(tenant)
    }

    /// Variante sem transação, direto na pool (leituras concorrentes sem lock).
    pub async fn find_tenant_of_pooled(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<Option<Uuid>>, AppError> {
        self.find_tenant_of(&self.pool, kind, id).await
    }
}

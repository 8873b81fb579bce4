// src/db/audit_repo.rs
//
// Consultas do auditor. Os nomes de tabela/coluna vêm do modelo de posse
// (SCOPED_TABLES) e ainda assim passam por `Ident`.

use sqlx::PgPool;
use uuid::Uuid;
use crate::{
    common::{error::AppError, sql::Ident},
    models::ownership::{ScopedTable, TenantForeignKey},
};

#[derive(Clone)]
pub struct AuditRepository {
    pool: PgPool,
}

impl AuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // 1. Linhas sem tenant
    pub async fn count_missing_tenant(&self, table: &Ident) -> Result<i64, AppError> {
        self.count(&format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id IS NULL",
            table.quoted()
        ))
            .await
    }

    // 2. tenant_id que não existe em tenants
    pub async fn count_unknown_tenant(&self, table: &Ident) -> Result<i64, AppError> {
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {} c
            WHERE c.tenant_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM tenants t WHERE t.id = c.tenant_id)
            "#,
            table.quoted()
        ))
            .await
    }

    // 2b. tenant existe mas não está ativo
    pub async fn count_inactive_tenant(&self, table: &Ident) -> Result<i64, AppError> {
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {} c
            JOIN tenants t ON t.id = c.tenant_id
            WHERE t.status <> 'active'
            "#,
            table.quoted()
        ))
            .await
    }

    // 3. FK cujo pai está em outro tenant
    pub async fn count_cross_tenant(
        &self,
        table: &Ident,
        column: &Ident,
        parent: &Ident,
    ) -> Result<i64, AppError> {
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {t} c
            JOIN {p} p ON p.id = c.{col}
            WHERE c.tenant_id IS NOT NULL
              AND p.tenant_id IS NOT NULL
              AND c.tenant_id <> p.tenant_id
            "#,
            t = table.quoted(),
            p = parent.quoted(),
            col = column.quoted()
        ))
            .await
    }

    // 4. FK apontando para linha inexistente
    pub async fn count_orphans(
        &self,
        table: &Ident,
        column: &Ident,
        parent: &Ident,
    ) -> Result<i64, AppError> {
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {t} c
            WHERE c.{col} IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM {p} p WHERE p.id = c.{col})
            "#,
            t = table.quoted(),
            p = parent.quoted(),
            col = column.quoted()
        ))
            .await
    }

    // 6. Distribuição de linhas por tenant
    pub async fn tenant_distribution(&self, table: &Ident) -> Result<Vec<(Uuid, i64)>, AppError> {
        let sql = format!(
            r#"
            SELECT tenant_id, COUNT(*) FROM {}
            WHERE tenant_id IS NOT NULL
            GROUP BY tenant_id
            ORDER BY COUNT(*) DESC
            "#,
            table.quoted()
        );
        let rows = sqlx::query_as::<_, (Uuid, i64)>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Correção "segura": preenche tenant_id de linhas filhas cujas FKs
    /// obrigatórias apontam todas para pais de um mesmo tenant, e esse tenant
    /// está ativo. Qualquer ambiguidade fica de fora.
    pub async fn backfill_tenant_from_parents(
        &self,
        table: &ScopedTable,
        required: &[&TenantForeignKey],
    ) -> Result<u64, AppError> {
        let Some((first, rest)) = required.split_first() else {
            return Ok(0);
        };

        let child = Ident::parse(table.name)?;
        let first_parent = Ident::parse(first.references)?;
        let first_col = Ident::parse(first.column)?;

        let mut from = format!("{} p0", first_parent.quoted());
        let mut conditions = vec![
            "c.tenant_id IS NULL".to_string(),
            format!("c.{} = p0.id", first_col.quoted()),
            "p0.tenant_id IS NOT NULL".to_string(),
            "EXISTS (SELECT 1 FROM tenants t WHERE t.id = p0.tenant_id AND t.status = 'active')"
                .to_string(),
        ];

        for (i, fk) in rest.iter().enumerate() {
            let alias = format!("p{}", i + 1);
            let parent = Ident::parse(fk.references)?;
            let col = Ident::parse(fk.column)?;
            from.push_str(&format!(", {} {}", parent.quoted(), alias));
            conditions.push(format!("c.{} = {}.id", col.quoted(), alias));
            conditions.push(format!("{}.tenant_id = p0.tenant_id", alias));
        }

        let sql = format!(
            "UPDATE {} c SET tenant_id = p0.tenant_id FROM {} WHERE {}",
            child.quoted(),
            from,
            conditions.join(" AND ")
        );

        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

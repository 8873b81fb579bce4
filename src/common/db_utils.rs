use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::common::error::AppError;
use crate::common::tenant::TenantContext;

// ---
// Helper RLS: A "Chave" para o Banco de Dados
// ---
/// Define `app.tenant_id` para a transação corrente (is_local = true).
/// Deve ser chamado logo após `begin()`; o valor some no commit/rollback,
/// então uma conexão devolvida à pool nunca carrega o tenant de outra requisição.
pub async fn set_tenant_scope(
    conn: &mut PgConnection,
    tenant: &TenantContext,
) -> Result<(), AppError> {
    sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
        .bind(tenant.0.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Abre uma transação já com a chave RLS do tenant.
/// Leituras também passam por aqui: sem a chave, um papel sujeito a RLS não vê nada.
pub async fn begin_scoped(
    pool: &PgPool,
    tenant: &TenantContext,
) -> Result<Transaction<'static, Postgres>, AppError> {
    let mut tx = pool.begin().await?;
    set_tenant_scope(&mut tx, tenant).await?;
    Ok(tx)
}

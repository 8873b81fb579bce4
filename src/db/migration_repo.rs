// src/db/migration_repo.rs

use sqlx::{Executor, PgConnection, PgPool, Postgres};
use uuid::Uuid;
use crate::{
    common::{
        error::AppError,
        sql::{column_list, Ident},
    },
    models::migration::{MigrationRecord, MigrationStatus},
};

#[derive(Clone)]
pub struct MigrationRepository {
    pool: PgPool,
}

impl MigrationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ---
    // Introspecção (somente leitura)
    // ---

    pub async fn table_exists<'e, E>(&self, executor: E, table: &Ident) -> Result<bool, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1::text) IS NOT NULL")
            .bind(table.quoted())
            .fetch_one(executor)
            .await?;

        Ok(exists)
    }

    /// Colunas da tabela no schema corrente, na ordem física.
    pub async fn table_columns<'e, E>(
        &self,
        executor: E,
        table: &Ident,
    ) -> Result<Vec<String>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let columns = sqlx::query_scalar::<_, String>(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
            .bind(table.as_str())
            .fetch_all(executor)
            .await?;

        Ok(columns)
    }

    pub async fn count_rows<'e, E>(&self, executor: E, table: &Ident) -> Result<i64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(executor)
            .await?;

        Ok(count)
    }

    /// Linhas que a migração alteraria: tenant_id NULL ou igual ao sentinela legado.
    pub async fn count_pending<'e, E>(
        &self,
        executor: E,
        table: &Ident,
        legacy_tenant_id: Option<Uuid>,
    ) -> Result<i64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id IS NULL OR tenant_id = $1",
            table.quoted()
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(legacy_tenant_id)
            .fetch_one(executor)
            .await?;

        Ok(count)
    }

    // ---
    // Backup e atualização
    // ---

    /// Snapshot completo (linha a linha) da tabela antes de qualquer alteração.
    pub async fn create_backup<'e, E>(
        &self,
        executor: E,
        table: &Ident,
        backup: &Ident,
    ) -> Result<u64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("CREATE TABLE {} AS TABLE {}", backup.quoted(), table.quoted());
        let result = sqlx::query(&sql).execute(executor).await?;

        Ok(result.rows_affected())
    }

    /// Lock consultivo da transação, com chave no nome da tabela.
    /// `false` = outra migração/rollback da mesma tabela está em andamento.
    pub async fn try_table_lock<'e, E>(&self, executor: E, table: &Ident) -> Result<bool, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let acquired = sqlx::query_scalar::<_, bool>(
            "SELECT pg_try_advisory_xact_lock(hashtext('merenda.migration.' || $1::text))",
        )
            .bind(table.as_str())
            .fetch_one(executor)
            .await?;

        Ok(acquired)
    }

    pub async fn lock_table_exclusive<'e, E>(&self, executor: E, table: &Ident) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("LOCK TABLE {} IN EXCLUSIVE MODE", table.quoted());
        sqlx::query(&sql).execute(executor).await?;

        Ok(())
    }

    pub async fn assign_tenant<'e, E>(
        &self,
        executor: E,
        table: &Ident,
        tenant_id: Uuid,
        legacy_tenant_id: Option<Uuid>,
    ) -> Result<u64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "UPDATE {} SET tenant_id = $1 WHERE tenant_id IS NULL OR tenant_id = $2",
            table.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(legacy_tenant_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }

    /// Restaura a tabela a partir do backup. Deve rodar dentro de uma transação:
    /// os gatilhos de FK ficam desligados só durante a troca (SET LOCAL) e são
    /// religados antes do commit.
    pub async fn restore_from_backup(
        &self,
        conn: &mut PgConnection,
        table: &Ident,
        backup: &Ident,
        columns: &[Ident],
    ) -> Result<u64, AppError> {
        sqlx::query("SET LOCAL session_replication_role = replica")
            .execute(&mut *conn)
            .await?;

        let delete = format!("DELETE FROM {}", table.quoted());
        sqlx::query(&delete).execute(&mut *conn).await?;

        let cols = column_list(columns);
        let insert = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            table.quoted(),
            cols,
            cols,
            backup.quoted()
        );
        let restored = sqlx::query(&insert).execute(&mut *conn).await?;

        sqlx::query("SET LOCAL session_replication_role = DEFAULT")
            .execute(&mut *conn)
            .await?;

        Ok(restored.rows_affected())
    }

    /// Única operação que remove um backup (passo explícito do operador).
    pub async fn drop_backup<'e, E>(&self, executor: E, backup: &Ident) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("DROP TABLE IF EXISTS {}", backup.quoted());
        sqlx::query(&sql).execute(executor).await?;

        Ok(())
    }

    // ---
    // Registros de migração
    // ---

    pub async fn insert_record<'e, E>(
        &self,
        executor: E,
        table_name: &str,
        tenant_id: Uuid,
    ) -> Result<MigrationRecord, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let record = sqlx::query_as::<_, MigrationRecord>(
            r#"
            INSERT INTO migration_records (table_name, tenant_id_assigned, status)
            VALUES ($1, $2, 'pending')
            RETURNING *
            "#,
        )
            .bind(table_name)
            .bind(tenant_id)
            .fetch_one(executor)
            .await?;

        Ok(record)
    }

    /// Avança o status só se o registro ainda estiver em `from`
    /// (a máquina de estados também vale no banco).
    pub async fn transition<'e, E>(
        &self,
        executor: E,
        id: Uuid,
        from: MigrationStatus,
        to: MigrationStatus,
        change: RecordChange<'_>,
    ) -> Result<MigrationRecord, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition { from, to });
        }

        let finished = matches!(
            to,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::RolledBack
        );

        let record = sqlx::query_as::<_, MigrationRecord>(
            r#"
            UPDATE migration_records
            SET status = $3,
                backup_table_name = COALESCE($4, backup_table_name),
                records_updated = COALESCE($5, records_updated),
                error = COALESCE($6, error),
                finished_at = CASE WHEN $7 THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
            .bind(id)
            .bind(from)
            .bind(to)
            .bind(change.backup_table_name)
            .bind(change.records_updated)
            .bind(change.error)
            .bind(finished)
            .fetch_optional(executor)
            .await?;

        record.ok_or(AppError::InvalidTransition { from, to })
    }

    pub async fn find_record(&self, id: Uuid) -> Result<Option<MigrationRecord>, AppError> {
        let record = sqlx::query_as::<_, MigrationRecord>(
            "SELECT * FROM migration_records WHERE id = $1",
        )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Último registro `completed` da tabela que tenha backup,
    /// opcionalmente filtrado pelo sufixo de timestamp do backup.
    pub async fn find_rollback_target(
        &self,
        table_name: &str,
        backup_suffix: Option<&str>,
    ) -> Result<Option<MigrationRecord>, AppError> {
        let record = sqlx::query_as::<_, MigrationRecord>(
            r#"
            SELECT * FROM migration_records
            WHERE table_name = $1
              AND status = 'completed'
              AND backup_table_name IS NOT NULL
              AND ($2::text IS NULL OR backup_table_name = $1 || '_backup_' || $2)
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
            .bind(table_name)
            .bind(backup_suffix)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Id da migração `completed` com backup mais recente da tabela.
    /// Só ela pode ser desfeita: um rollback mais antigo apagaria as linhas
    /// de migrações posteriores que continuariam marcadas como concluídas.
    pub async fn latest_completed_with_backup<'e, E>(
        &self,
        executor: E,
        table_name: &str,
    ) -> Result<Option<Uuid>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM migration_records
            WHERE table_name = $1
              AND status = 'completed'
              AND backup_table_name IS NOT NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
            .bind(table_name)
            .fetch_optional(executor)
            .await?;

        Ok(id)
    }

    pub async fn list_backup_records(&self) -> Result<Vec<MigrationRecord>, AppError> {
        let records = sqlx::query_as::<_, MigrationRecord>(
            r#"
            SELECT * FROM migration_records
            WHERE backup_table_name IS NOT NULL
            ORDER BY started_at DESC
            "#,
        )
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}

/// Campos opcionais gravados junto com uma transição de status.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordChange<'a> {
    pub backup_table_name: Option<&'a str>,
    pub records_updated: Option<i64>,
    pub error: Option<&'a str>,
}

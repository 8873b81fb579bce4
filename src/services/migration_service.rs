// src/services/migration_service.rs

use crate::{
    common::{error::AppError, sql::Ident},
    db::{MigrationRepository, TenantRepository},
    db::migration_repo::RecordChange,
    models::{
        migration::{
            BackupInfo, MigrationOutcome, MigrationPlan, MigrationRecord, MigrationStatus,
            TableMigrationResult,
        },
        ownership::{migration_order, scoped_table},
    },
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

const TENANT_COLUMN: &str = "tenant_id";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `<tabela>_backup_<YYYYmmdd_HHMMSS>`
pub fn backup_table_name(table: &str, at: DateTime<Utc>) -> String {
    format!("{}_backup_{}", table, at.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Colunas a restaurar: as da tabela viva que existem no backup.
/// Toda coluna viva precisa estar no backup, exceto tenant_id.
pub fn restorable_columns(
    backup_columns: &[String],
    live_columns: &[String],
) -> Result<Vec<String>, AppError> {
    let missing: Vec<&str> = live_columns
        .iter()
        .filter(|c| c.as_str() != TENANT_COLUMN && !backup_columns.contains(c))
        .map(String::as_str)
        .collect();

    if !missing.is_empty() {
        return Err(AppError::BackupIntegrity(format!(
            "colunas ausentes no backup: {}",
            missing.join(", ")
        )));
    }

    Ok(live_columns
        .iter()
        .filter(|c| backup_columns.contains(c))
        .cloned()
        .collect())
}

// ---
// O Motor de Migração
// ---
#[derive(Clone)]
pub struct MigrationService {
    pool: PgPool,
    repo: MigrationRepository,
    tenant_repo: TenantRepository,
    legacy_tenant_id: Option<Uuid>,
}

impl MigrationService {
    pub fn new(
        pool: PgPool,
        repo: MigrationRepository,
        tenant_repo: TenantRepository,
        legacy_tenant_id: Option<Uuid>,
    ) -> Self {
        Self { pool, repo, tenant_repo, legacy_tenant_id }
    }

    /// Ordem em que as tabelas devem ser migradas (dependências primeiro).
    pub fn migration_order(&self) -> Vec<&'static str> {
        migration_order()
    }

    // --- 1. Pré-requisitos ---
    async fn check_prerequisites(&self, table_name: &str, tenant_id: Uuid) -> Result<Ident, AppError> {
        let table = Ident::parse(table_name)?;

        if scoped_table(table_name).is_none() {
            return Err(AppError::Prerequisite(format!(
                "tabela '{}' não está registrada como escopada por tenant",
                table_name
            )));
        }

        if !self.repo.table_exists(&self.pool, &table).await? {
            return Err(AppError::Prerequisite(format!("tabela '{}' não existe", table_name)));
        }

        let columns = self.repo.table_columns(&self.pool, &table).await?;
        if !columns.iter().any(|c| c == TENANT_COLUMN) {
            return Err(AppError::Prerequisite(format!(
                "tabela '{}' não possui a coluna tenant_id",
                table_name
            )));
        }

        let tenant = self.tenant_repo
            .find_tenant(&self.pool, tenant_id)
            .await?
            .ok_or_else(|| AppError::Prerequisite(format!("tenant {} não existe", tenant_id)))?;

        if !tenant.is_active() {
            return Err(AppError::Prerequisite(format!(
                "tenant {} ({}) não está ativo",
                tenant.slug, tenant_id
            )));
        }

        Ok(table)
    }

    // O sentinela legado nunca é o próprio destino.
    fn legacy_for(&self, tenant_id: Uuid) -> Option<Uuid> {
        self.legacy_tenant_id.filter(|legacy| *legacy != tenant_id)
    }

    // --- 2. Execução ---
    pub async fn run_migration(
        &self,
        table_name: &str,
        tenant_id: Uuid,
        dry_run: bool,
    ) -> Result<MigrationOutcome, AppError> {
        let table = self.check_prerequisites(table_name, tenant_id).await?;
        let legacy = self.legacy_for(tenant_id);

        if dry_run {
            let pending_rows = self.repo.count_pending(&self.pool, &table, legacy).await?;
            tracing::info!("[dry-run] {}: {} linha(s) seriam atribuídas ao tenant {}", table, pending_rows, tenant_id);
            return Ok(MigrationOutcome::DryRun(MigrationPlan {
                table_name: table_name.to_string(),
                tenant_id,
                pending_rows,
            }));
        }

        let record = self.repo.insert_record(&self.pool, table_name, tenant_id).await?;
        let record = self.repo
            .transition(&self.pool, record.id, MigrationStatus::Pending, MigrationStatus::Running, RecordChange::default())
            .await?;

        tracing::info!("🚀 Migrando {} para o tenant {} (registro {})", table, tenant_id, record.id);

        match self.apply_locked(&table, tenant_id, legacy).await {
            Ok((updated, backup)) => {
                let record = self.repo
                    .transition(
                        &self.pool,
                        record.id,
                        MigrationStatus::Running,
                        MigrationStatus::Completed,
                        RecordChange {
                            backup_table_name: backup.as_deref(),
                            records_updated: Some(updated as i64),
                            error: None,
                        },
                    )
                    .await?;

                tracing::info!("✅ {}: {} linha(s) atualizada(s), backup {:?}", table, updated, backup);
                Ok(MigrationOutcome::Applied(record))
            }
            Err(e) => {
                tracing::error!("🔥 Migração de {} falhou: {}", table, e);
                let message = e.to_string();
                // O erro devolvido é sempre o da migração, mesmo se o registro não fechar.
                if let Err(te) = self.repo
                    .transition(
                        &self.pool,
                        record.id,
                        MigrationStatus::Running,
                        MigrationStatus::Failed,
                        RecordChange { error: Some(&message), ..Default::default() },
                    )
                    .await
                {
                    tracing::error!("Registro {} não pôde ser marcado como failed: {}", record.id, te);
                }
                Err(e)
            }
        }
    }

    /// Backup + atualização numa única transação, sob lock consultivo e
    /// lock exclusivo da tabela. Sem linhas pendentes não há backup.
    async fn apply_locked(
        &self,
        table: &Ident,
        tenant_id: Uuid,
        legacy: Option<Uuid>,
    ) -> Result<(u64, Option<String>), AppError> {
        let mut tx = self.pool.begin().await?;

        if !self.repo.try_table_lock(&mut *tx, table).await? {
            return Err(AppError::Prerequisite(format!(
                "outra migração ou rollback de '{}' está em andamento",
                table
            )));
        }
        self.repo.lock_table_exclusive(&mut *tx, table).await?;

        let pending = self.repo.count_pending(&mut *tx, table, legacy).await?;
        if pending == 0 {
            tx.commit().await?;
            return Ok((0, None));
        }

        let backup = Ident::parse(&backup_table_name(table.as_str(), Utc::now()))?;
        // O nome tem resolução de segundos: duas migrações no mesmo segundo colidem.
        if self.repo.table_exists(&mut *tx, &backup).await? {
            return Err(AppError::Prerequisite(format!(
                "backup '{}' já existe: aguarde um segundo e repita",
                backup
            )));
        }
        let copied = self.repo.create_backup(&mut *tx, table, &backup).await?;
        tracing::info!("Backup {} criado com {} linha(s)", backup, copied);

        let updated = self.repo.assign_tenant(&mut *tx, table, tenant_id, legacy).await?;

        tx.commit().await?;
        Ok((updated, Some(backup.as_str().to_string())))
    }

    /// Todas as tabelas registradas, na ordem de dependência. Falha em uma
    /// tabela não interrompe as demais; o cancelamento é checado entre tabelas.
    pub async fn run_all(&self, tenant_id: Uuid, cancel: &AtomicBool) -> Vec<TableMigrationResult> {
        let mut results = Vec::new();

        for table_name in self.migration_order() {
            // As tabelas restantes aparecem no resultado como canceladas.
            if cancel.load(Ordering::SeqCst) {
                tracing::warn!("Migração em lote cancelada: '{}' não foi migrada", table_name);
                results.push(TableMigrationResult {
                    table_name: table_name.to_string(),
                    record: None,
                    error: Some(AppError::Cancelled.to_string()),
                });
                continue;
            }

            let result = match self.run_migration(table_name, tenant_id, false).await {
                Ok(MigrationOutcome::Applied(record)) => TableMigrationResult {
                    table_name: table_name.to_string(),
                    record: Some(record),
                    error: None,
                },
                Ok(MigrationOutcome::DryRun(_)) => TableMigrationResult {
                    table_name: table_name.to_string(),
                    record: None,
                    error: None,
                },
                Err(e) => TableMigrationResult {
                    table_name: table_name.to_string(),
                    record: None,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }

        results
    }

    // --- 3. Rollback ---
    pub async fn find_rollback_target(
        &self,
        table_name: &str,
        backup_timestamp: Option<&str>,
    ) -> Result<MigrationRecord, AppError> {
        Ident::parse(table_name)?;

        self.repo
            .find_rollback_target(table_name, backup_timestamp)
            .await?
            .ok_or_else(|| {
                AppError::BackupIntegrity(format!(
                    "nenhuma migração concluída com backup para '{}'{}",
                    table_name,
                    backup_timestamp.map(|ts| format!(" no instante {}", ts)).unwrap_or_default()
                ))
            })
    }

    /// Destrutivo: a tabela viva é substituída pelo conteúdo do backup.
    pub async fn rollback(&self, record_id: Uuid) -> Result<MigrationRecord, AppError> {
        let record = self.repo
            .find_record(record_id)
            .await?
            .ok_or_else(|| AppError::BackupIntegrity(format!("registro de migração {} não encontrado", record_id)))?;

        if !record.status.can_transition_to(MigrationStatus::RolledBack) {
            return Err(AppError::InvalidTransition {
                from: record.status,
                to: MigrationStatus::RolledBack,
            });
        }

        let backup_name = record.backup_table_name.as_deref().ok_or_else(|| {
            AppError::BackupIntegrity(format!(
                "migração {} não alterou linhas e não tem backup",
                record_id
            ))
        })?;

        let table = Ident::parse(&record.table_name)?;
        let backup = Ident::parse(backup_name)?;

        let mut tx = self.pool.begin().await?;

        if !self.repo.try_table_lock(&mut *tx, &table).await? {
            return Err(AppError::Prerequisite(format!(
                "outra migração ou rollback de '{}' está em andamento",
                table
            )));
        }

        // 1. Só a migração concluída mais recente da tabela
        let latest = self.repo
            .latest_completed_with_backup(&mut *tx, &record.table_name)
            .await?;
        if latest != Some(record_id) {
            return Err(AppError::Prerequisite(format!(
                "'{}' tem migração concluída mais recente que {}: desfaça a mais recente primeiro",
                table, record_id
            )));
        }

        // 2. Backup existe, não está vazio e cobre as colunas atuais
        if !self.repo.table_exists(&mut *tx, &backup).await? {
            return Err(AppError::BackupIntegrity(format!("backup '{}' não existe", backup)));
        }
        if self.repo.count_rows(&mut *tx, &backup).await? == 0 {
            return Err(AppError::BackupIntegrity(format!("backup '{}' está vazio", backup)));
        }

        let backup_columns = self.repo.table_columns(&mut *tx, &backup).await?;
        let live_columns = self.repo.table_columns(&mut *tx, &table).await?;
        let columns = restorable_columns(&backup_columns, &live_columns)?
            .iter()
            .map(|c| Ident::parse(c))
            .collect::<Result<Vec<_>, _>>()?;

        // 3. Troca o conteúdo e fecha o registro na mesma transação
        self.repo.lock_table_exclusive(&mut *tx, &table).await?;
        let restored = self.repo.restore_from_backup(&mut tx, &table, &backup, &columns).await?;

        let record = self.repo
            .transition(
                &mut *tx,
                record_id,
                MigrationStatus::Completed,
                MigrationStatus::RolledBack,
                RecordChange::default(),
            )
            .await?;

        tx.commit().await?;

        tracing::warn!("↩️ Rollback de {}: {} linha(s) restaurada(s) de {}", table, restored, backup);
        Ok(record)
    }

    // --- 4. Backups ---
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>, AppError> {
        let records = self.repo.list_backup_records().await?;
        let mut backups = Vec::with_capacity(records.len());

        for record in records {
            let Some(name) = record.backup_table_name else {
                continue;
            };
            let ident = Ident::parse(&name)?;
            let exists = self.repo.table_exists(&self.pool, &ident).await?;
            let row_count = if exists {
                Some(self.repo.count_rows(&self.pool, &ident).await?)
            } else {
                None
            };

            backups.push(BackupInfo {
                backup_table_name: name,
                table_name: record.table_name,
                migration_id: record.id,
                status: record.status,
                created_at: record.started_at,
                exists,
                row_count,
            });
        }

        Ok(backups)
    }

    /// Único caminho que apaga um backup. Só aceita nomes registrados
    /// em migration_records.
    pub async fn cleanup_backup(&self, backup_name: &str) -> Result<(), AppError> {
        let backup = Ident::parse(backup_name)?;

        let known = self.repo
            .list_backup_records()
            .await?
            .iter()
            .any(|r| r.backup_table_name.as_deref() == Some(backup_name));

        if !known {
            return Err(AppError::Prerequisite(format!(
                "'{}' não é um backup registrado por uma migração",
                backup_name
            )));
        }

        self.repo.drop_backup(&self.pool, &backup).await?;
        tracing::info!("🗑️ Backup {} removido", backup);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn backup_name_carries_table_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 3).unwrap();
        let name = backup_table_name("estoque_movimentacoes", at);

        assert_eq!(name, "estoque_movimentacoes_backup_20261016_090503");
        // Continua sendo um identificador válido.
        assert!(Ident::parse(&name).is_ok());
    }

    #[test]
    fn restore_uses_live_columns_present_in_backup() {
        let backup = cols(&["id", "nome", "ativo", "tenant_id"]);
        let live = cols(&["id", "tenant_id", "nome", "ativo"]);

        assert_eq!(restorable_columns(&backup, &live).unwrap(), live);
    }

    #[test]
    fn backup_without_tenant_column_is_still_restorable() {
        let backup = cols(&["id", "nome"]);
        let live = cols(&["id", "nome", "tenant_id"]);

        assert_eq!(restorable_columns(&backup, &live).unwrap(), cols(&["id", "nome"]));
    }

    #[test]
    fn extra_backup_columns_are_ignored() {
        let backup = cols(&["id", "nome", "coluna_antiga"]);
        let live = cols(&["id", "nome"]);

        assert_eq!(restorable_columns(&backup, &live).unwrap(), live);
    }

    #[test]
    fn column_added_after_backup_blocks_rollback() {
        let backup = cols(&["id", "nome", "tenant_id"]);
        let live = cols(&["id", "nome", "tenant_id", "categoria"]);

        let err = restorable_columns(&backup, &live).unwrap_err();
        assert_matches!(err, AppError::BackupIntegrity(msg) if msg.contains("categoria"));
    }
}

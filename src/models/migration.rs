// src/models/migration.rs

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

// Máquina de estados de uma migração por tabela:
// pending -> running -> (completed | failed), e completed -> rolled_back (operador).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, RolledBack)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---
// Registro de migração (um por tabela por execução)
// ---
// backup_table_name é None quando a execução não tinha nada a migrar
// e, portanto, não tirou backup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: Uuid,
    pub table_name: String,
    pub backup_table_name: Option<String>,
    pub tenant_id_assigned: Uuid,
    pub records_updated: i64,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Resultado de um `--dry-run`: nada é gravado.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub table_name: String,
    pub tenant_id: Uuid,
    pub pending_rows: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum MigrationOutcome {
    DryRun(MigrationPlan),
    Applied(MigrationRecord),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub backup_table_name: String,
    pub table_name: String,
    pub migration_id: Uuid,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    pub exists: bool,
    pub row_count: Option<i64>,
}

/// Resultado por tabela de uma execução em lote (`run-all`).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMigrationResult {
    pub table_name: String,
    pub record: Option<MigrationRecord>,
    pub error: Option<String>,
}

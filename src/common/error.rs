use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::migration::MigrationStatus;
use crate::models::ownership::EntityRef;

/// Detalhe de uma violação de tenant: qual referência falhou, qual tenant
/// era esperado e qual foi encontrado na linha (None = linha sem tenant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipViolation {
    pub referencia: EntityRef,
    pub tenant_esperado: Uuid,
    pub tenant_encontrado: Option<Uuid>,
}

impl std::fmt::Display for OwnershipViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant_encontrado {
            Some(encontrado) => write!(
                f,
                "{} pertence ao tenant {} (esperado {})",
                self.referencia, encontrado, self.tenant_esperado
            ),
            None => write!(
                f,
                "{} não possui tenant (esperado {})",
                self.referencia, self.tenant_esperado
            ),
        }
    }
}

// Nosso tipo de erro, com `thiserror` para melhor ergonomia.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Erro de validação")]
    ValidationError(#[from] validator::ValidationErrors),

    // Acesso entre tenants: sempre rejeitado, nunca re-tentado.
    #[error("Acesso entre tenants negado: {0}")]
    CrossTenantAccess(OwnershipViolation),

    #[error("{0} não encontrado")]
    NotFound(EntityRef),

    #[error("Estoque insuficiente: solicitado {solicitado}, disponível {disponivel}")]
    InsufficientStock {
        solicitado: Decimal,
        disponivel: Decimal,
    },

    #[error("Pré-requisito não atendido: {0}")]
    Prerequisite(String),

    #[error("Backup inválido para rollback: {0}")]
    BackupIntegrity(String),

    #[error("Transição de status inválida: {from} -> {to}")]
    InvalidTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    // Qualquer falha do banco durante uma operação: a transação inteira é desfeita.
    #[error("Falha de transação no banco de dados: {0}")]
    TransactionFailure(#[from] sqlx::Error),

    #[error("Operação cancelada")]
    Cancelled,

    #[error("Erro interno: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Apenas falhas de banco são transitórias. Violações de tenant,
    /// estoque insuficiente e pré-requisitos exigem ação de quem chamou.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransactionFailure(_))
    }

    pub fn is_cross_tenant(&self) -> bool {
        matches!(self, AppError::CrossTenantAccess(_))
    }
}

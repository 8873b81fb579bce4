// src/models/tenancy.rs

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "tenant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

// ---
// 1. Tenant (A raiz do isolamento)
// ---
// Criado pelo provisionamento (fora deste crate). Nunca é apagado
// fisicamente enquanto houver linhas apontando para ele.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

// ---
// 2. Produto
// ---
// tenant_id é Option apenas por causa das linhas legadas
// que ainda não passaram pelo motor de migração.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Produto {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub nome: String,
    pub categoria: Option<String>,
    pub ativo: bool,
    // 'true' para produtos controlados por lote/validade (FEFO)
    pub controla_lotes: bool,
}

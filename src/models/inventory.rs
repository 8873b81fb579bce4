// src/models/inventory.rs

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc, NaiveDate};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const DIAS_CRITICO: i64 = 7;
pub const DIAS_ATENCAO: i64 = 30;

// Código do lote usado quando uma entrada de produto controlado por lote
// não informa o lote.
pub const LOTE_PADRAO: &str = "PADRAO";

// --- 1. Saldo agregado (um por Escola x Produto) ---
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StockAggregate {
    pub id: Uuid,
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub quantidade_atual: Decimal,
    pub tem_lotes_vencidos: bool,
    pub tem_lotes_criticos: bool,
    pub updated_at: DateTime<Utc>,
}

// --- 2. Lotes ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "lote_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoteStatus {
    Ativo,
    Esgotado,
    Vencido,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StockLot {
    pub id: Uuid,
    pub produto_id: Uuid,
    pub escola_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub lote: String,
    pub quantidade_inicial: Decimal,
    pub quantidade_atual: Decimal,
    pub data_validade: Option<NaiveDate>, // Data simples (Dia/Mês/Ano)
    pub status: LoteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// O mínimo de um lote para decidir se uma entrada pode reaproveitar o código,
/// lido mesmo quando o lote é de outro tenant.
#[derive(Debug, Clone, FromRow)]
pub struct LotOwnership {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub status: LoteStatus,
    pub data_validade: Option<NaiveDate>,
}

/// Situação de validade calculada para relatórios (não é persistida).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StatusValidade {
    Vencido,
    Critico,
    Atencao,
    Normal,
}

impl StatusValidade {
    /// Lote sem validade é sempre `Normal`.
    pub fn from_date(data_validade: Option<NaiveDate>, today: NaiveDate) -> Self {
        let Some(validade) = data_validade else {
            return StatusValidade::Normal;
        };

        let dias = (validade - today).num_days();
        if dias <= 0 {
            StatusValidade::Vencido
        } else if dias <= DIAS_CRITICO {
            StatusValidade::Critico
        } else if dias <= DIAS_ATENCAO {
            StatusValidade::Atencao
        } else {
            StatusValidade::Normal
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotWithStatus {
    #[serde(flatten)]
    pub lote: StockLot,
    pub status_validade: StatusValidade,
}

// --- 3. Movimentações (somente-inserção) ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "movimentacao_tipo", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    Entrada,
    Saida,
    Ajuste,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: Uuid,
    pub lote_id: Option<Uuid>,
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub tipo: MovementType,
    pub quantidade: Decimal,
    pub quantidade_anterior: Decimal,
    pub quantidade_posterior: Decimal,
    pub motivo: Option<String>,
    pub created_at: DateTime<Utc>,
}

// Espelho por (escola, produto) das mudanças no saldo agregado.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StockHistory {
    pub id: Uuid,
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub tipo: MovementType,
    pub quantidade: Decimal,
    pub quantidade_anterior: Decimal,
    pub quantidade_posterior: Decimal,
    pub motivo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Linha de uma movimentação a ser gravada (o banco gera id e created_at).
#[derive(Debug, Clone, PartialEq)]
pub struct NewMovement<'a> {
    pub lote_id: Option<Uuid>,
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub tipo: MovementType,
    pub quantidade: Decimal,
    pub quantidade_anterior: Decimal,
    pub quantidade_posterior: Decimal,
    pub motivo: Option<&'a str>,
}

// ---
// Validação Customizada
// ---
fn validate_not_negative(val: &Decimal) -> Result<(), ValidationError> {
    if val.is_sign_negative() {
        let mut err = ValidationError::new("range");
        err.add_param("min".into(), &0.0);
        err.message = Some("O valor não pode ser negativo.".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoteEntrada {
    #[validate(length(min = 1, max = 64, message = "O código do lote é obrigatório."))]
    pub codigo: String,
    pub data_validade: Option<NaiveDate>,
}

// ---
// Payload: movimentação de estoque
// ---
// Não existe tenant_id aqui: o tenant vem do TenantContext.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MovementRequest {
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub tipo: MovementType,

    // Para 'ajuste' é o novo saldo absoluto; para entrada/saída, a quantidade movida.
    #[validate(custom(function = "validate_not_negative"))]
    pub quantidade: Decimal,

    #[validate(length(max = 500, message = "O motivo pode ter no máximo 500 caracteres."))]
    pub motivo: Option<String>,

    #[validate(nested)]
    pub lote: Option<LoteEntrada>,
}

impl MovementRequest {
    // Entrada e saída com quantidade zero não geram movimentação útil.
    pub fn validate_consistency(&self) -> Result<(), ValidationError> {
        if self.tipo != MovementType::Ajuste && self.quantidade.is_zero() {
            let mut err = ValidationError::new("QuantidadeZero");
            err.message = Some("A quantidade deve ser maior que zero.".into());
            return Err(err);
        }
        if self.tipo != MovementType::Entrada && self.lote.is_some() {
            let mut err = ValidationError::new("LoteSomenteEmEntrada");
            err.message = Some("Lote só pode ser informado em entradas.".into());
            return Err(err);
        }
        Ok(())
    }
}

/// Quanto foi retirado de cada lote numa alocação FEFO.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LotAllocation {
    pub lote_id: Uuid,
    pub quantidade: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementOutcome {
    pub novo_saldo: StockAggregate,
    pub lotes_afetados: Vec<LotAllocation>,
    pub movimentacoes: Vec<StockMovement>,
}

// --- 4. Drift entre agregado e soma dos lotes ---
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub quantidade_agregado: Decimal,
    pub quantidade_lotes: Decimal,
    pub delta: Decimal,
}

/// Linha bruta vinda do banco: par (escola, produto) com ao menos um lote.
#[derive(Debug, Clone, FromRow)]
pub struct PairBalance {
    pub escola_id: Uuid,
    pub produto_id: Uuid,
    pub quantidade_agregado: Decimal,
    pub quantidade_lotes: Decimal,
}

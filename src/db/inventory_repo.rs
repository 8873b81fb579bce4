// src/db/inventory_repo.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{Executor, Postgres};
use uuid::Uuid;
use crate::{
    common::error::AppError,
    models::inventory::{
        DIAS_CRITICO, LotOwnership, LoteStatus, NewMovement, PairBalance, StockAggregate,
        StockHistory, StockLot, StockMovement,
    },
};

// Sem pool própria: toda consulta de estoque roda na transação com a chave RLS
// aberta pelo serviço.
#[derive(Clone, Default)]
pub struct InventoryRepository;

impl InventoryRepository {
    pub fn new() -> Self {
        Self
    }

    // ---
    // Funções de "Leitura" (Getters)
    // ---
    // Leituras são snapshots pontuais: sem lock.

    pub async fn get_aggregate<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Option<StockAggregate>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let aggregate = sqlx::query_as::<_, StockAggregate>(
            r#"
            SELECT * FROM estoque_escolas
            WHERE escola_id = $1 AND produto_id = $2 AND tenant_id = $3
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .fetch_optional(executor)
            .await?;

        Ok(aggregate)
    }

    /// (quantidade de lotes ativos, soma de quantidade_atual dos lotes ativos)
    pub async fn active_lot_balance<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<(i64, Decimal), AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let balance = sqlx::query_as::<_, (i64, Decimal)>(
            r#"
            SELECT COUNT(*), COALESCE(SUM(quantidade_atual), 0)
            FROM estoque_lotes
            WHERE escola_id = $1 AND produto_id = $2 AND tenant_id = $3
              AND status = 'ativo'
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .fetch_one(executor)
            .await?;

        Ok(balance)
    }

    pub async fn list_lots<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Vec<StockLot>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lots = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT * FROM estoque_lotes
            WHERE escola_id = $1 AND produto_id = $2 AND tenant_id = $3
            ORDER BY data_validade ASC NULLS LAST, created_at ASC
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .fetch_all(executor)
            .await?;

        Ok(lots)
    }

    /// Um registro por par (escola, produto) do tenant que tenha ao menos um lote,
    /// com o saldo agregado (0 se a linha não existir) e a soma dos lotes ativos.
    pub async fn pair_balances<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Vec<PairBalance>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query_as::<_, PairBalance>(
            r#"
            SELECT
                l.escola_id,
                l.produto_id,
                COALESCE(MAX(e.quantidade_atual), 0) AS quantidade_agregado,
                COALESCE(SUM(l.quantidade_atual) FILTER (WHERE l.status = 'ativo'), 0) AS quantidade_lotes
            FROM estoque_lotes l
            LEFT JOIN estoque_escolas e
                ON e.escola_id = l.escola_id
               AND e.produto_id = l.produto_id
               AND e.tenant_id = l.tenant_id
            WHERE l.tenant_id = $1
            GROUP BY l.escola_id, l.produto_id
            ORDER BY l.escola_id, l.produto_id
            "#,
        )
            .bind(tenant_id)
            .fetch_all(executor)
            .await?;

        Ok(rows)
    }

    /// Pares (escola, produto) com lote ativo vencido, sem lock e em ordem.
    /// A baixa trava o agregado de cada par antes dos lotes, na mesma ordem
    /// de uma saída, para não cruzar locks com ela.
    pub async fn expired_pairs<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<(Uuid, Uuid)>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let pairs = sqlx::query_as::<_, (Uuid, Uuid)>(
            r#"
            SELECT DISTINCT escola_id, produto_id FROM estoque_lotes
            WHERE tenant_id = $1
              AND status = 'ativo'
              AND data_validade IS NOT NULL
              AND data_validade <= $2
            ORDER BY escola_id, produto_id
            "#,
        )
            .bind(tenant_id)
            .bind(today)
            .fetch_all(executor)
            .await?;

        Ok(pairs)
    }

    // ---
    // Funções de "Escrita" (Transacionais)
    // ---
    // Todas recebem o executor da transação aberta pelo serviço.

    /// Cria o saldo agregado se ainda não existir (criação preguiçosa na 1ª movimentação).
    pub async fn ensure_aggregate<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO estoque_escolas (escola_id, produto_id, tenant_id, quantidade_atual)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (escola_id, produto_id) DO NOTHING
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .execute(executor)
            .await?;

        Ok(())
    }

    /// Trava a linha do saldo agregado. Busca só por (escola, produto):
    /// o serviço confere o tenant da linha, para que uma linha de outro tenant
    /// vire erro explícito em vez de "não encontrado".
    pub async fn lock_aggregate<'e, E>(
        &self,
        executor: E,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Option<StockAggregate>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let aggregate = sqlx::query_as::<_, StockAggregate>(
            r#"
            SELECT * FROM estoque_escolas
            WHERE escola_id = $1 AND produto_id = $2
            FOR UPDATE
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .fetch_optional(executor)
            .await?;

        Ok(aggregate)
    }

    /// Grava o novo saldo e recalcula as flags de validade a partir dos lotes.
    pub async fn update_aggregate<'e, E>(
        &self,
        executor: E,
        aggregate_id: Uuid,
        quantidade: Decimal,
        today: NaiveDate,
    ) -> Result<StockAggregate, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let aggregate = sqlx::query_as::<_, StockAggregate>(
            r#"
            UPDATE estoque_escolas e
            SET quantidade_atual = $2,
                updated_at = NOW(),
                tem_lotes_vencidos = EXISTS (
                    SELECT 1 FROM estoque_lotes l
                    WHERE l.escola_id = e.escola_id AND l.produto_id = e.produto_id
                      AND l.tenant_id = e.tenant_id
                      AND l.status = 'ativo' AND l.quantidade_atual > 0
                      AND l.data_validade <= $3
                ),
                tem_lotes_criticos = EXISTS (
                    SELECT 1 FROM estoque_lotes l
                    WHERE l.escola_id = e.escola_id AND l.produto_id = e.produto_id
                      AND l.tenant_id = e.tenant_id
                      AND l.status = 'ativo' AND l.quantidade_atual > 0
                      AND l.data_validade > $3
                      AND l.data_validade <= $3 + $4::int
                )
            WHERE e.id = $1
            RETURNING *
            "#,
        )
            .bind(aggregate_id)
            .bind(quantidade)
            .bind(today)
            .bind(DIAS_CRITICO as i32)
            .fetch_one(executor)
            .await?;

        Ok(aggregate)
    }

    /// Lotes elegíveis para FEFO, travados: ativos, com saldo, não vencidos.
    /// Sem validade vai para o fim da fila.
    pub async fn lock_fefo_lots<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<StockLot>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lots = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT * FROM estoque_lotes
            WHERE escola_id = $1 AND produto_id = $2 AND tenant_id = $3
              AND status = 'ativo'
              AND quantidade_atual > 0
              AND (data_validade IS NULL OR data_validade > $4)
            ORDER BY data_validade ASC NULLS LAST, created_at ASC
            FOR UPDATE
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .bind(today)
            .fetch_all(executor)
            .await?;

        Ok(lots)
    }

    /// Lotes ativos do par cuja validade já passou, travados para baixa.
    /// Chamar só com o agregado do par já travado.
    pub async fn lock_expired_lots<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<StockLot>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lots = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT * FROM estoque_lotes
            WHERE escola_id = $1 AND produto_id = $2 AND tenant_id = $3
              AND status = 'ativo'
              AND data_validade IS NOT NULL
              AND data_validade <= $4
            ORDER BY data_validade, created_at
            FOR UPDATE
            "#,
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(tenant_id)
            .bind(today)
            .fetch_all(executor)
            .await?;

        Ok(lots)
    }

    /// Cria o lote ou soma ao existente (mesmo código na mesma escola/produto).
    /// Retorna None se o lote existente pertencer a outro tenant.
    pub async fn upsert_lot<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        escola_id: Uuid,
        produto_id: Uuid,
        codigo: &str,
        data_validade: Option<NaiveDate>,
        quantidade: Decimal,
    ) -> Result<Option<StockLot>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lot = sqlx::query_as::<_, StockLot>(
            r#"
            INSERT INTO estoque_lotes
                (produto_id, escola_id, tenant_id, lote, quantidade_inicial, quantidade_atual, data_validade, status)
            VALUES ($1, $2, $3, $4, $5, $5, $6, 'ativo')
            ON CONFLICT (escola_id, produto_id, lote)
            DO UPDATE SET
                quantidade_inicial = estoque_lotes.quantidade_inicial + EXCLUDED.quantidade_inicial,
                quantidade_atual = estoque_lotes.quantidade_atual + EXCLUDED.quantidade_atual,
                data_validade = COALESCE(EXCLUDED.data_validade, estoque_lotes.data_validade),
                status = 'ativo',
                updated_at = NOW()
            WHERE estoque_lotes.tenant_id = EXCLUDED.tenant_id
            RETURNING *
            "#,
        )
            .bind(produto_id)
            .bind(escola_id)
            .bind(tenant_id)
            .bind(codigo)
            .bind(quantidade)
            .bind(data_validade)
            .fetch_optional(executor)
            .await?;

        Ok(lot)
    }

    /// Lote com esse código, sem filtrar por tenant (nem pelo RLS).
    pub async fn find_lot_by_code<'e, E>(
        &self,
        executor: E,
        escola_id: Uuid,
        produto_id: Uuid,
        codigo: &str,
    ) -> Result<Option<LotOwnership>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lot = sqlx::query_as::<_, LotOwnership>(
            "SELECT * FROM estoque_lote_por_codigo($1, $2, $3)",
        )
            .bind(escola_id)
            .bind(produto_id)
            .bind(codigo)
            .fetch_optional(executor)
            .await?;

        Ok(lot)
    }

    /// (id, tenant_id) do saldo agregado do par, sem filtrar por tenant (nem pelo RLS).
    pub async fn find_aggregate_owner<'e, E>(
        &self,
        executor: E,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Option<(Uuid, Option<Uuid>)>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let owner = sqlx::query_as::<_, (Uuid, Option<Uuid>)>(
            "SELECT id, tenant_id FROM estoque_dono_do_par($1, $2)",
        )
            .bind(escola_id)
            .bind(produto_id)
            .fetch_optional(executor)
            .await?;

        Ok(owner)
    }

    pub async fn set_lot_quantity<'e, E>(
        &self,
        executor: E,
        lote_id: Uuid,
        quantidade: Decimal,
        status: LoteStatus,
    ) -> Result<StockLot, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lot = sqlx::query_as::<_, StockLot>(
            r#"
            UPDATE estoque_lotes
            SET quantidade_atual = $2, status = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
            .bind(lote_id)
            .bind(quantidade)
            .bind(status)
            .fetch_one(executor)
            .await?;

        Ok(lot)
    }

    /// Registra uma movimentação no livro-razão (somente-inserção).
    pub async fn record_stock_movement<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        movement: &NewMovement<'_>,
    ) -> Result<StockMovement, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let movement = sqlx::query_as::<_, StockMovement>(
            r#"
            INSERT INTO estoque_movimentacoes
                (lote_id, escola_id, produto_id, tenant_id, tipo, quantidade,
                 quantidade_anterior, quantidade_posterior, motivo)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
            .bind(movement.lote_id)
            .bind(movement.escola_id)
            .bind(movement.produto_id)
            .bind(tenant_id)
            .bind(movement.tipo)
            .bind(movement.quantidade)
            .bind(movement.quantidade_anterior)
            .bind(movement.quantidade_posterior)
            .bind(movement.motivo)
            .fetch_one(executor)
            .await?;

        Ok(movement)
    }

    /// Espelho da mudança no saldo agregado (lote_id é ignorado).
    pub async fn record_stock_history<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        change: &NewMovement<'_>,
    ) -> Result<StockHistory, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let history = sqlx::query_as::<_, StockHistory>(
            r#"
            INSERT INTO estoque_historico
                (escola_id, produto_id, tenant_id, tipo, quantidade,
                 quantidade_anterior, quantidade_posterior, motivo)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
            .bind(change.escola_id)
            .bind(change.produto_id)
            .bind(tenant_id)
            .bind(change.tipo)
            .bind(change.quantidade)
            .bind(change.quantidade_anterior)
            .bind(change.quantidade_posterior)
            .bind(change.motivo)
            .fetch_one(executor)
            .await?;

        Ok(history)
    }
}

// src/services/inventory_service.rs

use crate::{
    common::{
        db_utils::begin_scoped,
        error::{AppError, OwnershipViolation},
        tenant::TenantContext,
    },
    db::{InventoryRepository, TenantRepository},
    models::{
        inventory::{
            DriftReport, LOTE_PADRAO, LotAllocation, LotOwnership, LotWithStatus, LoteStatus, MovementOutcome,
            MovementRequest, MovementType, NewMovement, PairBalance, StatusValidade, StockAggregate,
            StockLot, StockMovement,
        },
        ownership::{EntityKind, EntityRef},
        tenancy::Produto,
    },
    services::ownership_service::OwnershipService,
};
use anyhow::anyhow;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;
use validator::Validate;

// ---
// Regras puras (sem banco)
// ---

/// Soma dos lotes ativos se houver algum lote ativo; senão o agregado; senão zero.
pub fn effective_quantity(active_lots: (i64, Decimal), aggregate: Option<Decimal>) -> Decimal {
    let (count, sum) = active_lots;
    if count > 0 {
        sum
    } else {
        aggregate.unwrap_or(Decimal::ZERO)
    }
}

/// Ordem FEFO: ativos, com saldo e não vencidos; validade mais próxima primeiro,
/// sem validade por último, empate pela data de criação.
pub fn fefo_candidates(lots: &[StockLot], today: NaiveDate) -> Vec<&StockLot> {
    let mut candidates: Vec<&StockLot> = lots
        .iter()
        .filter(|l| l.status == LoteStatus::Ativo && l.quantidade_atual > Decimal::ZERO)
        .filter(|l| l.data_validade.is_none_or(|v| v > today))
        .collect();

    candidates.sort_by(|a, b| {
        let key = |l: &StockLot| (l.data_validade.is_none(), l.data_validade, l.created_at);
        key(a).cmp(&key(b))
    });
    candidates
}

/// Plano guloso de retirada. Falha sem plano parcial se o total ativo
/// não cobre o pedido.
pub fn plan_fefo(
    lots: &[StockLot],
    needed: Decimal,
    today: NaiveDate,
) -> Result<Vec<LotAllocation>, AppError> {
    let candidates = fefo_candidates(lots, today);

    let disponivel: Decimal = candidates.iter().map(|l| l.quantidade_atual).sum();
    if disponivel < needed {
        return Err(AppError::InsufficientStock {
            solicitado: needed,
            disponivel,
        });
    }

    let mut remaining = needed;
    let mut plan = Vec::new();
    for lot in candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        let to_take = lot.quantidade_atual.min(remaining);
        plan.push(LotAllocation {
            lote_id: lot.id,
            quantidade: to_take,
        });
        remaining -= to_take;
    }

    Ok(plan)
}

/// Pares cuja diferença absoluta passa do epsilon (tolerância de arredondamento).
pub fn drift_reports(rows: Vec<PairBalance>, epsilon: Decimal) -> Vec<DriftReport> {
    rows.into_iter()
        .filter_map(|row| {
            let delta = (row.quantidade_agregado - row.quantidade_lotes).abs();
            (delta > epsilon).then(|| DriftReport {
                escola_id: row.escola_id,
                produto_id: row.produto_id,
                quantidade_agregado: row.quantidade_agregado,
                quantidade_lotes: row.quantidade_lotes,
                delta,
            })
        })
        .collect()
}

/// Uma entrada só reaproveita o código de um lote do mesmo tenant que ainda
/// possa receber estoque: nada de reativar lote vencido.
pub fn check_lot_reuse(
    existing: &LotOwnership,
    tenant_id: Uuid,
    data_validade: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<(), AppError> {
    if existing.tenant_id != Some(tenant_id) {
        return Err(AppError::CrossTenantAccess(OwnershipViolation {
            referencia: EntityRef::new(EntityKind::Lote, existing.id),
            tenant_esperado: tenant_id,
            tenant_encontrado: existing.tenant_id,
        }));
    }

    let vencido = existing.status == LoteStatus::Vencido
        || data_validade.or(existing.data_validade).is_some_and(|v| v <= today);
    if vencido {
        return Err(AppError::Prerequisite(format!(
            "lote {} está vencido: use um novo código de lote",
            existing.id
        )));
    }
    Ok(())
}

/// Em produto com lote, o agregado só pode ser ajustado para a soma dos lotes
/// ativos; outro valor abriria drift. Para alinhar, existe `correct_drift`.
pub fn check_ajuste_target(
    soma_lotes: Decimal,
    alvo: Decimal,
    epsilon: Decimal,
) -> Result<(), AppError> {
    if (alvo - soma_lotes).abs() > epsilon {
        return Err(AppError::Prerequisite(format!(
            "ajuste para {} diverge da soma dos lotes ativos ({}): movimente os lotes ou use a correção de drift",
            alvo, soma_lotes
        )));
    }
    Ok(())
}

fn consistency_error(e: validator::ValidationError) -> AppError {
    let mut errors = validator::ValidationErrors::new();
    errors.add("quantidade", e);
    AppError::ValidationError(errors)
}

// O que uma variante de movimentação produziu antes de gravar o agregado.
struct Applied {
    novo_saldo: Decimal,
    quantidade_historico: Decimal,
    lotes: Vec<LotAllocation>,
    movimentacoes: Vec<StockMovement>,
}

// ---
// O Reconciliador de Estoque
// ---
#[derive(Clone)]
pub struct InventoryService {
    pool: PgPool,
    inventory_repo: InventoryRepository,
    tenant_repo: TenantRepository,
    ownership: OwnershipService,
    drift_epsilon: Decimal,
}

impl InventoryService {
    pub fn new(
        pool: PgPool,
        inventory_repo: InventoryRepository,
        tenant_repo: TenantRepository,
        ownership: OwnershipService,
        drift_epsilon: Decimal,
    ) -> Self {
        Self { pool, inventory_repo, tenant_repo, ownership, drift_epsilon }
    }

    // --- LEITURA: saldo efetivo ---
    pub async fn get_effective_quantity(
        &self,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Decimal, AppError> {
        let mut tx = begin_scoped(&self.pool, tenant).await?;
        self.validate_pair(&mut tx, tenant, escola_id, produto_id).await?;

        let lots = self.inventory_repo
            .active_lot_balance(&mut *tx, tenant.id(), escola_id, produto_id)
            .await?;
        let aggregate = self.inventory_repo
            .get_aggregate(&mut *tx, tenant.id(), escola_id, produto_id)
            .await?
            .map(|a| a.quantidade_atual);
        tx.commit().await?;

        Ok(effective_quantity(lots, aggregate))
    }

    // --- LEITURA: lotes com situação de validade ---
    pub async fn list_lots_with_status(
        &self,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<LotWithStatus>, AppError> {
        let mut tx = begin_scoped(&self.pool, tenant).await?;
        self.validate_pair(&mut tx, tenant, escola_id, produto_id).await?;

        let lots = self.inventory_repo
            .list_lots(&mut *tx, tenant.id(), escola_id, produto_id)
            .await?;
        tx.commit().await?;

        Ok(lots
            .into_iter()
            .map(|lote| LotWithStatus {
                status_validade: StatusValidade::from_date(lote.data_validade, today),
                lote,
            })
            .collect())
    }

    // --- LEITURA: drift entre agregado e lotes ---
    // Só detecta. A correção é `correct_drift`, chamada de propósito.
    pub async fn detect_drift(&self, tenant: &TenantContext) -> Result<Vec<DriftReport>, AppError> {
        let mut tx = begin_scoped(&self.pool, tenant).await?;
        let rows = self.inventory_repo.pair_balances(&mut *tx, tenant.id()).await?;
        tx.commit().await?;

        let reports = drift_reports(rows, self.drift_epsilon);

        if !reports.is_empty() {
            tracing::warn!(
                "Drift de estoque no tenant {}: {} par(es) divergente(s)",
                tenant,
                reports.len()
            );
        }
        Ok(reports)
    }

    // --- ESCRITA: movimentação (entrada / saída / ajuste) ---
    pub async fn apply_movement(
        &self,
        tenant: &TenantContext,
        request: MovementRequest,
        today: NaiveDate,
    ) -> Result<MovementOutcome, AppError> {
        request.validate()?;
        request.validate_consistency().map_err(consistency_error)?;

        let mut tx = begin_scoped(&self.pool, tenant).await?;

        let outcome = self.apply_in_tx(&mut tx, tenant, &request, today).await?;

        // Qualquer erro acima derruba a transação (drop = rollback):
        // nenhuma movimentação parcial fica gravada.
        tx.commit().await?;

        tracing::info!(
            "Movimentação {:?} aplicada: escola {} produto {} -> saldo {}",
            request.tipo,
            request.escola_id,
            request.produto_id,
            outcome.novo_saldo.quantidade_atual
        );
        Ok(outcome)
    }

    /// Retira quantidade dos lotes em ordem FEFO, dentro da transação de quem chama.
    /// Cada lote tocado gera uma movimentação 'saida'.
    pub async fn allocate_fefo(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
        quantity: Decimal,
        motivo: Option<&str>,
        today: NaiveDate,
    ) -> Result<(Vec<LotAllocation>, Vec<StockMovement>), AppError> {
        // Relê as quantidades sob lock antes de decrementar.
        let lots = self.inventory_repo
            .lock_fefo_lots(&mut *conn, tenant.id(), escola_id, produto_id, today)
            .await?;

        let plan = plan_fefo(&lots, quantity, today)?;

        let mut movimentacoes = Vec::with_capacity(plan.len());
        for allocation in &plan {
            let lot = lots
                .iter()
                .find(|l| l.id == allocation.lote_id)
                .ok_or_else(|| anyhow!("lote {} sumiu do plano FEFO", allocation.lote_id))?;

            let restante = lot.quantidade_atual - allocation.quantidade;
            let status = if restante.is_zero() { LoteStatus::Esgotado } else { LoteStatus::Ativo };

            self.inventory_repo
                .set_lot_quantity(&mut *conn, lot.id, restante, status)
                .await?;

            let movement = self.inventory_repo
                .record_stock_movement(
                    &mut *conn,
                    tenant.id(),
                    &NewMovement {
                        lote_id: Some(lot.id),
                        escola_id,
                        produto_id,
                        tipo: MovementType::Saida,
                        quantidade: allocation.quantidade,
                        quantidade_anterior: lot.quantidade_atual,
                        quantidade_posterior: restante,
                        motivo,
                    },
                )
                .await?;
            movimentacoes.push(movement);
        }

        Ok((plan, movimentacoes))
    }

    // --- ESCRITA: baixa de lotes vencidos ---
    // Marca como 'vencido' e tira do agregado, para que a soma dos lotes
    // ativos continue igual ao agregado. Ordem de lock igual à da saída:
    // agregado do par primeiro, depois os lotes.
    pub async fn expire_lots(
        &self,
        tenant: &TenantContext,
        today: NaiveDate,
    ) -> Result<Vec<StockMovement>, AppError> {
        let mut tx = begin_scoped(&self.pool, tenant).await?;

        let pairs = self.inventory_repo
            .expired_pairs(&mut *tx, tenant.id(), today)
            .await?;

        let motivo = Some("Baixa por vencimento");
        let mut movimentacoes = Vec::new();

        for (escola_id, produto_id) in pairs {
            let aggregate = self.lock_or_create_aggregate(&mut tx, tenant, escola_id, produto_id).await?;

            // Relidos sob lock: uma saída concorrente pode ter esgotado algum.
            let lots = self.inventory_repo
                .lock_expired_lots(&mut *tx, tenant.id(), escola_id, produto_id, today)
                .await?;
            if lots.is_empty() {
                continue;
            }

            let mut baixado = Decimal::ZERO;
            for lot in lots {
                self.inventory_repo
                    .set_lot_quantity(&mut *tx, lot.id, Decimal::ZERO, LoteStatus::Vencido)
                    .await?;

                if lot.quantidade_atual > Decimal::ZERO {
                    let movement = self.inventory_repo
                        .record_stock_movement(
                            &mut *tx,
                            tenant.id(),
                            &NewMovement {
                                lote_id: Some(lot.id),
                                escola_id,
                                produto_id,
                                tipo: MovementType::Saida,
                                quantidade: lot.quantidade_atual,
                                quantidade_anterior: lot.quantidade_atual,
                                quantidade_posterior: Decimal::ZERO,
                                motivo,
                            },
                        )
                        .await?;
                    movimentacoes.push(movement);
                    baixado += lot.quantidade_atual;
                }
            }

            let novo_saldo = aggregate.quantidade_atual - baixado;
            self.inventory_repo
                .update_aggregate(&mut *tx, aggregate.id, novo_saldo, today)
                .await?;

            if !baixado.is_zero() {
                self.inventory_repo
                    .record_stock_history(
                        &mut *tx,
                        tenant.id(),
                        &NewMovement {
                            lote_id: None,
                            escola_id,
                            produto_id,
                            tipo: MovementType::Saida,
                            quantidade: baixado,
                            quantidade_anterior: aggregate.quantidade_atual,
                            quantidade_posterior: novo_saldo,
                            motivo,
                        },
                    )
                    .await?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            "Baixa por vencimento no tenant {}: {} lote(s) com saldo",
            tenant,
            movimentacoes.len()
        );
        Ok(movimentacoes)
    }

    // --- ESCRITA: correção deliberada de drift ---
    // Alinha o agregado à soma dos lotes ativos com um 'ajuste' auditado.
    pub async fn correct_drift(
        &self,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
        motivo: &str,
        today: NaiveDate,
    ) -> Result<MovementOutcome, AppError> {
        let mut tx = begin_scoped(&self.pool, tenant).await?;

        let produto = self.validate_pair(&mut tx, tenant, escola_id, produto_id).await?;
        if !produto.controla_lotes {
            return Err(AppError::Prerequisite(format!(
                "produto {} não controla lotes: não há lotes para servir de referência",
                produto_id
            )));
        }

        // Trava o agregado antes de somar os lotes: toda movimentação passa por esse lock.
        self.lock_or_create_aggregate(&mut tx, tenant, escola_id, produto_id).await?;
        let (_, soma_lotes) = self.inventory_repo
            .active_lot_balance(&mut *tx, tenant.id(), escola_id, produto_id)
            .await?;

        let request = MovementRequest {
            escola_id,
            produto_id,
            tipo: MovementType::Ajuste,
            quantidade: soma_lotes,
            motivo: Some(format!("Correção de drift: {}", motivo)),
            lote: None,
        };
        request.validate()?;

        let outcome = self.apply_in_tx(&mut tx, tenant, &request, today).await?;
        tx.commit().await?;

        tracing::info!(
            "Drift corrigido: escola {} produto {} -> saldo {}",
            escola_id,
            produto_id,
            soma_lotes
        );
        Ok(outcome)
    }

    // ---
    // Internos
    // ---

    /// Posse das duas entidades + consistência entre elas; devolve o produto.
    async fn validate_pair(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Produto, AppError> {
        let escola = EntityRef::new(EntityKind::Escola, escola_id);
        let produto = EntityRef::new(EntityKind::Produto, produto_id);

        self.ownership
            .validate_mixed_entities(&mut *conn, &[escola, produto], tenant)
            .await?;
        self.ownership
            .validate_school_product_tenant_consistency(&mut *conn, escola_id, produto_id)
            .await?;

        self.tenant_repo
            .find_produto(&mut *conn, tenant.id(), produto_id)
            .await?
            .ok_or(AppError::NotFound(produto))
    }

    async fn lock_or_create_aggregate(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<StockAggregate, AppError> {
        self.inventory_repo
            .ensure_aggregate(&mut *conn, tenant.id(), escola_id, produto_id)
            .await?;

        let locked = self.inventory_repo
            .lock_aggregate(&mut *conn, escola_id, produto_id)
            .await?;

        // Sob RLS a linha de outro tenant nem aparece: pergunta o dono por fora.
        let (id, dono) = match locked {
            Some(aggregate) if aggregate.tenant_id == Some(tenant.id()) => return Ok(aggregate),
            Some(aggregate) => (aggregate.id, aggregate.tenant_id),
            None => self.inventory_repo
                .find_aggregate_owner(&mut *conn, escola_id, produto_id)
                .await?
                .ok_or_else(|| anyhow!("saldo de escola {} produto {} não encontrado após criação", escola_id, produto_id))?,
        };

        Err(AppError::CrossTenantAccess(OwnershipViolation {
            referencia: EntityRef::new(EntityKind::Estoque, id),
            tenant_esperado: tenant.id(),
            tenant_encontrado: dono,
        }))
    }

    async fn apply_in_tx(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        request: &MovementRequest,
        today: NaiveDate,
    ) -> Result<MovementOutcome, AppError> {
        // 1. Posse: antes de qualquer escrita
        let produto = self
            .validate_pair(&mut *conn, tenant, request.escola_id, request.produto_id)
            .await?;

        // 2. Trava o saldo agregado (criado na 1ª movimentação)
        let aggregate = self
            .lock_or_create_aggregate(&mut *conn, tenant, request.escola_id, request.produto_id)
            .await?;

        // 3. Aplica a variante
        let applied = match request.tipo {
            MovementType::Entrada => self.apply_entrada(conn, tenant, &produto, &aggregate, request, today).await?,
            MovementType::Saida => self.apply_saida(conn, tenant, &produto, &aggregate, request, today).await?,
            MovementType::Ajuste => self.apply_ajuste(conn, tenant, &produto, &aggregate, request).await?,
        };

        // 4. Grava o agregado (e recalcula as flags de validade)
        let novo_saldo = self.inventory_repo
            .update_aggregate(&mut *conn, aggregate.id, applied.novo_saldo, today)
            .await?;

        // 5. Histórico do agregado, na mesma transação
        self.inventory_repo
            .record_stock_history(
                &mut *conn,
                tenant.id(),
                &NewMovement {
                    lote_id: None,
                    escola_id: request.escola_id,
                    produto_id: request.produto_id,
                    tipo: request.tipo,
                    quantidade: applied.quantidade_historico,
                    quantidade_anterior: aggregate.quantidade_atual,
                    quantidade_posterior: applied.novo_saldo,
                    motivo: request.motivo.as_deref(),
                },
            )
            .await?;

        Ok(MovementOutcome {
            novo_saldo,
            lotes_afetados: applied.lotes,
            movimentacoes: applied.movimentacoes,
        })
    }

    async fn apply_entrada(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        produto: &Produto,
        aggregate: &StockAggregate,
        request: &MovementRequest,
        today: NaiveDate,
    ) -> Result<Applied, AppError> {
        let quantidade = request.quantidade;
        let novo_saldo = aggregate.quantidade_atual + quantidade;

        let (lote_id, anterior, posterior, lotes) = if produto.controla_lotes {
            let (codigo, validade) = match &request.lote {
                Some(l) => (l.codigo.as_str(), l.data_validade),
                None => (LOTE_PADRAO, None),
            };

            // O agregado já está travado: ninguém cria este lote em paralelo.
            let existing = self.inventory_repo
                .find_lot_by_code(&mut *conn, request.escola_id, request.produto_id, codigo)
                .await?;
            if let Some(existing) = &existing {
                check_lot_reuse(existing, tenant.id(), validade, today)?;
            }

            let lot = self.inventory_repo
                .upsert_lot(
                    &mut *conn,
                    tenant.id(),
                    request.escola_id,
                    request.produto_id,
                    codigo,
                    validade,
                    quantidade,
                )
                .await?
                .ok_or_else(|| anyhow!("lote {} em conflito com outro tenant após a verificação", codigo))?;

            let alloc = LotAllocation { lote_id: lot.id, quantidade };
            (
                Some(lot.id),
                lot.quantidade_atual - quantidade,
                lot.quantidade_atual,
                vec![alloc],
            )
        } else {
            (None, aggregate.quantidade_atual, novo_saldo, Vec::new())
        };

        let movement = self.inventory_repo
            .record_stock_movement(
                &mut *conn,
                tenant.id(),
                &NewMovement {
                    lote_id,
                    escola_id: request.escola_id,
                    produto_id: request.produto_id,
                    tipo: MovementType::Entrada,
                    quantidade,
                    quantidade_anterior: anterior,
                    quantidade_posterior: posterior,
                    motivo: request.motivo.as_deref(),
                },
            )
            .await?;

        Ok(Applied {
            novo_saldo,
            quantidade_historico: quantidade,
            lotes,
            movimentacoes: vec![movement],
        })
    }

    async fn apply_saida(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        produto: &Produto,
        aggregate: &StockAggregate,
        request: &MovementRequest,
        today: NaiveDate,
    ) -> Result<Applied, AppError> {
        if produto.controla_lotes {
            let (lotes, movimentacoes) = self
                .allocate_fefo(
                    &mut *conn,
                    tenant,
                    request.escola_id,
                    request.produto_id,
                    request.quantidade,
                    request.motivo.as_deref(),
                    today,
                )
                .await?;

            let retirado: Decimal = lotes.iter().map(|a| a.quantidade).sum();
            return Ok(Applied {
                novo_saldo: aggregate.quantidade_atual - retirado,
                quantidade_historico: retirado,
                lotes,
                movimentacoes,
            });
        }

        // Produto sem lote: o agregado é a única fonte.
        if aggregate.quantidade_atual < request.quantidade {
            return Err(AppError::InsufficientStock {
                solicitado: request.quantidade,
                disponivel: aggregate.quantidade_atual,
            });
        }

        let novo_saldo = aggregate.quantidade_atual - request.quantidade;
        let movement = self.inventory_repo
            .record_stock_movement(
                &mut *conn,
                tenant.id(),
                &NewMovement {
                    lote_id: None,
                    escola_id: request.escola_id,
                    produto_id: request.produto_id,
                    tipo: MovementType::Saida,
                    quantidade: request.quantidade,
                    quantidade_anterior: aggregate.quantidade_atual,
                    quantidade_posterior: novo_saldo,
                    motivo: request.motivo.as_deref(),
                },
            )
            .await?;

        Ok(Applied {
            novo_saldo,
            quantidade_historico: request.quantidade,
            lotes: Vec::new(),
            movimentacoes: vec![movement],
        })
    }

    async fn apply_ajuste(
        &self,
        conn: &mut PgConnection,
        tenant: &TenantContext,
        produto: &Produto,
        aggregate: &StockAggregate,
        request: &MovementRequest,
    ) -> Result<Applied, AppError> {
        if produto.controla_lotes {
            let (_, soma_lotes) = self.inventory_repo
                .active_lot_balance(&mut *conn, tenant.id(), request.escola_id, request.produto_id)
                .await?;
            check_ajuste_target(soma_lotes, request.quantidade, self.drift_epsilon)?;
        }

        // Saldo absoluto; a movimentação guarda o delta com sinal.
        let novo_saldo = request.quantidade;
        let delta = novo_saldo - aggregate.quantidade_atual;

        let movement = self.inventory_repo
            .record_stock_movement(
                &mut *conn,
                tenant.id(),
                &NewMovement {
                    lote_id: None,
                    escola_id: request.escola_id,
                    produto_id: request.produto_id,
                    tipo: MovementType::Ajuste,
                    quantidade: delta,
                    quantidade_anterior: aggregate.quantidade_atual,
                    quantidade_posterior: novo_saldo,
                    motivo: request.motivo.as_deref(),
                },
            )
            .await?;

        Ok(Applied {
            novo_saldo,
            quantidade_historico: delta,
            lotes: Vec::new(),
            movimentacoes: vec![movement],
        })
    }
}

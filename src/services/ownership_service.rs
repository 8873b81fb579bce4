// src/services/ownership_service.rs

use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    common::{
        error::{AppError, OwnershipViolation},
        tenant::TenantContext,
    },
    db::OwnershipRepository,
    models::ownership::{EntityKind, EntityRef},
};

/// De onde o validador lê o tenant de uma entidade.
/// `None` = não existe; `Some(None)` = existe sem tenant.
#[allow(async_fn_in_trait)]
pub trait TenantLookup {
    async fn tenant_of(&mut self, entity: EntityRef) -> Result<Option<Option<Uuid>>, AppError>;
}

/// Busca no banco usando a conexão (ou transação) de quem chamou.
pub struct ConnLookup<'a> {
    repo: &'a OwnershipRepository,
    conn: &'a mut PgConnection,
}

impl TenantLookup for ConnLookup<'_> {
    async fn tenant_of(&mut self, entity: EntityRef) -> Result<Option<Option<Uuid>>, AppError> {
        self.repo
            .find_tenant_of(&mut *self.conn, entity.kind, entity.id)
            .await
    }
}

// ---
// Regras puras
// ---

pub(crate) fn check_ownership(
    entity: EntityRef,
    tenant_id: Uuid,
    found: Option<Option<Uuid>>,
) -> Result<(), AppError> {
    match found {
        None => Err(AppError::NotFound(entity)),
        Some(Some(owner)) if owner == tenant_id => Ok(()),
        Some(owner) => Err(AppError::CrossTenantAccess(OwnershipViolation {
            referencia: entity,
            tenant_esperado: tenant_id,
            tenant_encontrado: owner,
        })),
    }
}

/// Escola e produto precisam ter o mesmo tenant (e ter algum).
/// Retorna o tenant comum.
pub(crate) fn check_pair_consistency(
    escola: EntityRef,
    escola_tenant: Option<Uuid>,
    produto: EntityRef,
    produto_tenant: Option<Uuid>,
) -> Result<Uuid, AppError> {
    match (escola_tenant, produto_tenant) {
        (Some(a), Some(b)) if a == b => Ok(a),
        (Some(a), b) => Err(AppError::CrossTenantAccess(OwnershipViolation {
            referencia: produto,
            tenant_esperado: a,
            tenant_encontrado: b,
        })),
        // Escola sem tenant: não há tenant de referência (nil).
        (None, b) => Err(AppError::CrossTenantAccess(OwnershipViolation {
            referencia: escola,
            tenant_esperado: b.unwrap_or(Uuid::nil()),
            tenant_encontrado: None,
        })),
    }
}

pub async fn validate_ownership_with<L: TenantLookup>(
    lookup: &mut L,
    entity: EntityRef,
    tenant: &TenantContext,
) -> Result<(), AppError> {
    let found = lookup.tenant_of(entity).await?;
    check_ownership(entity, tenant.id(), found)
}

/// Valida um conjunto heterogêneo e para na primeira violação.
/// O erro carrega a referência que falhou.
pub async fn validate_mixed_with<L: TenantLookup>(
    lookup: &mut L,
    refs: &[EntityRef],
    tenant: &TenantContext,
) -> Result<(), AppError> {
    for entity in refs {
        validate_ownership_with(lookup, *entity, tenant).await?;
    }
    Ok(())
}

pub async fn validate_pair_with<L: TenantLookup>(
    lookup: &mut L,
    escola_id: Uuid,
    produto_id: Uuid,
) -> Result<Uuid, AppError> {
    let escola = EntityRef::new(EntityKind::Escola, escola_id);
    let produto = EntityRef::new(EntityKind::Produto, produto_id);

    let escola_tenant = lookup.tenant_of(escola).await?.ok_or(AppError::NotFound(escola))?;
    let produto_tenant = lookup.tenant_of(produto).await?.ok_or(AppError::NotFound(produto))?;

    check_pair_consistency(escola, escola_tenant, produto, produto_tenant)
}

// ---
// O Validador de Posse
// ---
// Somente leitura. Quem chama rejeita a requisição inteira em caso de erro,
// antes de qualquer escrita.
#[derive(Clone)]
pub struct OwnershipService {
    repo: OwnershipRepository,
}

impl OwnershipService {
    pub fn new(repo: OwnershipRepository) -> Self {
        Self { repo }
    }

    fn lookup<'a>(&'a self, conn: &'a mut PgConnection) -> ConnLookup<'a> {
        ConnLookup { repo: &self.repo, conn }
    }

    pub async fn validate_ownership(
        &self,
        conn: &mut PgConnection,
        kind: EntityKind,
        id: Uuid,
        tenant: &TenantContext,
    ) -> Result<(), AppError> {
        let entity = EntityRef::new(kind, id);
        let result = validate_ownership_with(&mut self.lookup(conn), entity, tenant).await;
        log_violation(&result, tenant);
        result
    }

    pub async fn validate_mixed_entities(
        &self,
        conn: &mut PgConnection,
        refs: &[EntityRef],
        tenant: &TenantContext,
    ) -> Result<(), AppError> {
        let result = validate_mixed_with(&mut self.lookup(conn), refs, tenant).await;
        log_violation(&result, tenant);
        result
    }

    /// Independe do tenant de quem chama: protege contra uma migração que
    /// tenha atribuído tenants diferentes à escola e ao produto.
    pub async fn validate_school_product_tenant_consistency(
        &self,
        conn: &mut PgConnection,
        escola_id: Uuid,
        produto_id: Uuid,
    ) -> Result<Uuid, AppError> {
        let result = validate_pair_with(&mut self.lookup(conn), escola_id, produto_id).await;
        if let Err(AppError::CrossTenantAccess(v)) = &result {
            tracing::error!("🔥 Escola e produto em tenants diferentes: {}", v);
        }
        result
    }

    /// Leitura sem transação (snapshot), direto na pool.
    pub async fn owner_of(&self, kind: EntityKind, id: Uuid) -> Result<Option<Option<Uuid>>, AppError> {
        self.repo.find_tenant_of_pooled(kind, id).await
    }
}

// Violação entre tenants nunca é silenciosa.
fn log_violation(result: &Result<(), AppError>, tenant: &TenantContext) {
    if let Err(AppError::CrossTenantAccess(v)) = result {
        tracing::warn!("⛔ Tentativa de acesso entre tenants pelo tenant {}: {}", tenant, v);
    }
}

// src/config.rs

use crate::{
    db::{AuditRepository, InventoryRepository, MigrationRepository, OwnershipRepository, TenantRepository},
    services::{AuditService, InventoryService, MigrationService, OwnershipService},
};
use anyhow::Context;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{env, str::FromStr, time::Duration};
use uuid::Uuid;

// ---
// Configuração lida do ambiente (.env é opcional)
// ---
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    // Tolerância de arredondamento na comparação agregado x lotes
    pub drift_epsilon: Decimal,
    // Tenant "coringa" usado pelos dados legados; tratado como não atribuído
    pub legacy_tenant_id: Option<Uuid>,
    pub skew_threshold: f64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL deve ser definida")?;

        let legacy_tenant_id = match env::var("LEGACY_TENANT_ID") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                Uuid::parse_str(raw.trim()).context("LEGACY_TENANT_ID não é um UUID válido")?,
            ),
            _ => None,
        };

        let skew_threshold: f64 = parse_var("SKEW_THRESHOLD", 0.95)?;
        if !(0.0..=1.0).contains(&skew_threshold) {
            anyhow::bail!("SKEW_THRESHOLD deve estar entre 0 e 1");
        }

        Ok(Self {
            database_url,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 5)?,
            acquire_timeout: Duration::from_secs(parse_var("DB_ACQUIRE_TIMEOUT_SECS", 3)?),
            drift_epsilon: parse_var("DRIFT_EPSILON", Decimal::new(1, 3))?,
            legacy_tenant_id,
            skew_threshold,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: '{}'", name, raw)),
        _ => Ok(default),
    }
}

// O gráfico de dependências montado uma vez na inicialização
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub ownership_service: OwnershipService,
    pub inventory_service: InventoryService,
    pub migration_service: MigrationService,
    pub audit_service: AuditService,
}

impl AppState {
    pub async fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .context("Falha ao conectar ao banco de dados")?;

        tracing::info!("✅ Conexão com o banco de dados estabelecida com sucesso!");

        Ok(Self::from_pool(db_pool, config))
    }

    // Separado de `new` para os testes de integração, que recebem a pool pronta.
    pub fn from_pool(db_pool: PgPool, config: &AppConfig) -> Self {
        // --- Repositórios ---
        let ownership_repo = OwnershipRepository::new(db_pool.clone());
        let tenant_repo = TenantRepository::new(db_pool.clone());
        let inventory_repo = InventoryRepository::new();
        let migration_repo = MigrationRepository::new(db_pool.clone());
        let audit_repo = AuditRepository::new(db_pool.clone());

        // --- Serviços ---
        let ownership_service = OwnershipService::new(ownership_repo);
        let inventory_service = InventoryService::new(
            db_pool.clone(),
            inventory_repo,
            tenant_repo.clone(),
            ownership_service.clone(),
            config.drift_epsilon,
        );
        let migration_service = MigrationService::new(
            db_pool.clone(),
            migration_repo,
            tenant_repo.clone(),
            config.legacy_tenant_id,
        );
        let audit_service = AuditService::new(
            audit_repo,
            tenant_repo,
            inventory_service.clone(),
            config.skew_threshold,
        );

        Self {
            db_pool,
            ownership_service,
            inventory_service,
            migration_service,
            audit_service,
        }
    }
}

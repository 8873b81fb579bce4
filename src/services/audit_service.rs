// src/services/audit_service.rs

use crate::{
    common::{error::AppError, sql::Ident, tenant::TenantContext},
    db::{AuditRepository, TenantRepository},
    models::{
        audit::{AuditCheck, AuditIssue, AuditReport, CheckStatus, Severity},
        ownership::{SCOPED_TABLES, ScopedTable},
    },
    services::inventory_service::InventoryService,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

// ---
// Regras puras
// ---

/// Converte uma contagem em resultado de checagem. Erro de banco vira falha
/// (a auditoria continua nas demais checagens).
pub fn count_outcome(
    table: &str,
    check: AuditCheck,
    on_hit: (CheckStatus, Severity),
    count: Result<i64, AppError>,
    what: &str,
) -> AuditIssue {
    let (status, severity, message, affected_rows) = match count {
        Ok(0) => (CheckStatus::Pass, Severity::Info, format!("nenhuma linha com {}", what), 0),
        Ok(n) => (on_hit.0, on_hit.1, format!("{} linha(s) com {}", n, what), n),
        Err(e) => (CheckStatus::Fail, Severity::High, format!("falha ao verificar {}: {}", what, e), 0),
    };

    AuditIssue {
        table: table.to_string(),
        check,
        status,
        severity,
        message,
        affected_rows,
        details: None,
    }
}

/// Tenant dominante e sua fatia, se a tabela tem mais de um tenant e um
/// deles passa do limite. Sinal de migração incompleta, não falha.
pub fn distribution_skew(counts: &[(Uuid, i64)], threshold: f64) -> Option<(Uuid, f64)> {
    if counts.len() < 2 {
        return None;
    }

    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let (top, top_count) = counts.iter().max_by_key(|(_, n)| *n)?;
    if total == 0 {
        return None;
    }

    let share = *top_count as f64 / total as f64;
    (share > threshold).then_some((*top, share))
}

// ---
// O Auditor de Integridade Referencial
// ---
// Somente leitura, exceto no modo `fix_minor`, que apenas preenche tenant_id
// quando todos os pais obrigatórios concordam.
#[derive(Clone)]
pub struct AuditService {
    repo: AuditRepository,
    tenant_repo: TenantRepository,
    inventory: InventoryService,
    skew_threshold: f64,
}

impl AuditService {
    pub fn new(
        repo: AuditRepository,
        tenant_repo: TenantRepository,
        inventory: InventoryService,
        skew_threshold: f64,
    ) -> Self {
        Self { repo, tenant_repo, inventory, skew_threshold }
    }

    pub async fn run_full_validation(&self, fix_minor: bool, cancel: &AtomicBool) -> AuditReport {
        let mut report = AuditReport::new();

        for table in SCOPED_TABLES {
            if cancel.load(Ordering::SeqCst) {
                tracing::warn!("Auditoria cancelada antes de '{}'", table.name);
                report.cancelled = true;
                return report;
            }
            self.audit_table(table, fix_minor, &mut report).await;
        }

        if cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            return report;
        }
        self.check_quantities(&mut report).await;

        tracing::info!(
            "Auditoria concluída: {} checagens, {} ok, {} falhas, {} avisos",
            report.summary.total,
            report.summary.passed,
            report.summary.failed,
            report.summary.warnings
        );
        report
    }

    async fn audit_table(&self, table: &ScopedTable, fix_minor: bool, report: &mut AuditReport) {
        let ident = match Ident::parse(table.name) {
            Ok(ident) => ident,
            Err(e) => {
                report.record(count_outcome(
                    table.name,
                    AuditCheck::TenantIdCompleteness,
                    (CheckStatus::Fail, Severity::High),
                    Err(e),
                    "nome de tabela",
                ));
                return;
            }
        };

        // 1. tenant_id preenchido
        let mut missing = self.repo.count_missing_tenant(&ident).await;
        if fix_minor && matches!(missing, Ok(n) if n > 0) {
            missing = self.backfill(table, &ident, missing, report).await;
        }
        report.record(count_outcome(
            table.name,
            AuditCheck::TenantIdCompleteness,
            (CheckStatus::Fail, Severity::High),
            missing,
            "tenant_id NULL",
        ));

        // 2. tenant existe (e está ativo)
        report.record(count_outcome(
            table.name,
            AuditCheck::TenantExistence,
            (CheckStatus::Fail, Severity::Critical),
            self.repo.count_unknown_tenant(&ident).await,
            "tenant inexistente",
        ));
        report.record(count_outcome(
            table.name,
            AuditCheck::TenantExistence,
            (CheckStatus::Warning, Severity::Medium),
            self.repo.count_inactive_tenant(&ident).await,
            "tenant suspenso ou apagado",
        ));

        // 3 e 4. Cada FK: mesmo tenant nos dois lados, e pai existente
        for fk in table.foreign_keys {
            let (column, parent) = match (Ident::parse(fk.column), Ident::parse(fk.references)) {
                (Ok(c), Ok(p)) => (c, p),
                (Err(e), _) | (_, Err(e)) => {
                    report.record(count_outcome(
                        table.name,
                        AuditCheck::CrossTenant,
                        (CheckStatus::Fail, Severity::Critical),
                        Err(e),
                        "FK declarada",
                    ));
                    continue;
                }
            };

            let mut cross = count_outcome(
                table.name,
                AuditCheck::CrossTenant,
                (CheckStatus::Fail, Severity::Critical),
                self.repo.count_cross_tenant(&ident, &column, &parent).await,
                &format!("{} apontando para {} de outro tenant", fk.column, fk.references),
            );
            if cross.status == CheckStatus::Fail && cross.affected_rows > 0 {
                // Nunca resolvido automaticamente.
                tracing::error!("⛔ {}: {}", table.name, cross.message);
                cross.details = Some(json!({ "column": fk.column, "references": fk.references }));
            }
            report.record(cross);

            report.record(count_outcome(
                table.name,
                AuditCheck::OrphanedReference,
                (CheckStatus::Fail, Severity::High),
                self.repo.count_orphans(&ident, &column, &parent).await,
                &format!("{} sem linha correspondente em {}", fk.column, fk.references),
            ));
        }

        // 6. Distribuição por tenant
        report.record(self.distribution_issue(table.name, &ident).await);
    }

    async fn backfill(
        &self,
        table: &ScopedTable,
        ident: &Ident,
        missing: Result<i64, AppError>,
        report: &mut AuditReport,
    ) -> Result<i64, AppError> {
        let required = table.required_foreign_keys();
        if required.is_empty() {
            // Sem pai para inferir o tenant: fica para o motor de migração.
            return missing;
        }

        match self.repo.backfill_tenant_from_parents(table, &required).await {
            Ok(fixed) => {
                report.summary.fixed_rows += fixed as i64;
                tracing::info!("🔧 {}: tenant_id preenchido em {} linha(s)", table.name, fixed);
                self.repo.count_missing_tenant(ident).await
            }
            Err(e) => {
                tracing::warn!("Correção de {} não aplicada: {}", table.name, e);
                missing
            }
        }
    }

    async fn distribution_issue(&self, table: &str, ident: &Ident) -> AuditIssue {
        let mut issue = AuditIssue {
            table: table.to_string(),
            check: AuditCheck::TenantDistribution,
            status: CheckStatus::Pass,
            severity: Severity::Info,
            message: "distribuição entre tenants sem concentração".to_string(),
            affected_rows: 0,
            details: None,
        };

        match self.repo.tenant_distribution(ident).await {
            Ok(counts) => {
                if let Some((tenant, share)) = distribution_skew(&counts, self.skew_threshold) {
                    let total: i64 = counts.iter().map(|(_, n)| n).sum();
                    issue.status = CheckStatus::Warning;
                    issue.message = format!(
                        "tenant {} concentra {:.1}% das linhas (possível migração incompleta)",
                        tenant,
                        share * 100.0
                    );
                    issue.affected_rows = total;
                    issue.details = Some(json!({
                        "tenantId": tenant,
                        "share": share,
                        "tenants": counts.len(),
                    }));
                }
            }
            Err(e) => {
                issue.status = CheckStatus::Fail;
                issue.severity = Severity::High;
                issue.message = format!("falha ao verificar distribuição: {}", e);
            }
        }
        issue
    }

    // 5. Consistência de quantidade: drift por tenant
    async fn check_quantities(&self, report: &mut AuditReport) {
        let tenants = match self.tenant_repo.list_live_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                report.record(count_outcome(
                    "estoque_escolas",
                    AuditCheck::QuantityConsistency,
                    (CheckStatus::Fail, Severity::Medium),
                    Err(e),
                    "tenants",
                ));
                return;
            }
        };

        for tenant in tenants {
            let ctx = TenantContext(tenant.id);
            let mut issue = count_outcome(
                "estoque_escolas",
                AuditCheck::QuantityConsistency,
                (CheckStatus::Fail, Severity::Medium),
                Ok(0),
                "drift",
            );

            match self.inventory.detect_drift(&ctx).await {
                Ok(reports) if reports.is_empty() => {
                    issue.message = format!("tenant {}: agregado e lotes conferem", tenant.slug);
                }
                Ok(reports) => {
                    issue.status = CheckStatus::Fail;
                    issue.severity = Severity::Medium;
                    issue.affected_rows = reports.len() as i64;
                    issue.message = format!(
                        "tenant {}: {} par(es) escola/produto com drift entre agregado e lotes",
                        tenant.slug,
                        reports.len()
                    );
                    issue.details = serde_json::to_value(&reports).ok();
                }
                Err(e) => {
                    issue.status = CheckStatus::Fail;
                    issue.severity = Severity::High;
                    issue.message = format!("tenant {}: falha ao verificar drift: {}", tenant.slug, e);
                }
            }
            report.record(issue);
        }
    }
}

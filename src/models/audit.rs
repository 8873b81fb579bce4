// src/models/audit.rs

use serde::Serialize;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCheck {
    TenantIdCompleteness,
    TenantExistence,
    // FK apontando para linha de outro tenant: a classe mais grave.
    CrossTenant,
    OrphanedReference,
    QuantityConsistency,
    TenantDistribution,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIssue {
    pub table: String,
    pub check: AuditCheck,
    pub status: CheckStatus,
    pub severity: Severity,
    pub message: String,
    pub affected_rows: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub fixed_rows: i64,
}

// O relatório: contagens + itens que falharam ou geraram aviso.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub summary: AuditSummary,
    pub issues: Vec<AuditIssue>,
    pub cancelled: bool,
}

impl AuditReport {
    pub fn new() -> Self {
        Self {
            generated_at: Utc::now(),
            summary: AuditSummary::default(),
            issues: Vec::new(),
            cancelled: false,
        }
    }

    /// Contabiliza um resultado; só falhas e avisos entram em `issues`.
    pub fn record(&mut self, issue: AuditIssue) {
        self.summary.total += 1;
        match issue.status {
            CheckStatus::Pass => self.summary.passed += 1,
            CheckStatus::Fail => {
                self.summary.failed += 1;
                self.issues.push(issue);
            }
            CheckStatus::Warning => {
                self.summary.warnings += 1;
                self.issues.push(issue);
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.summary.failed == 0
    }

    /// Código de saída para automação: 0 sem falhas, 1 caso contrário.
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }

    pub fn count_by(&self, check: AuditCheck) -> usize {
        self.issues.iter().filter(|i| i.check == check).count()
    }
}

impl Default for AuditReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(status: CheckStatus) -> AuditIssue {
        AuditIssue {
            table: "escolas".into(),
            check: AuditCheck::TenantIdCompleteness,
            status,
            severity: Severity::High,
            message: String::new(),
            affected_rows: 0,
            details: None,
        }
    }

    #[test]
    fn summary_counts_every_check_but_lists_only_problems() {
        let mut report = AuditReport::new();
        report.record(issue(CheckStatus::Pass));
        report.record(issue(CheckStatus::Pass));
        report.record(issue(CheckStatus::Warning));

        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.warnings, 1);
        assert_eq!(report.issues.len(), 1);
        // Aviso não reprova a execução.
        assert_eq!(report.exit_code(), 0);

        report.record(issue(CheckStatus::Fail));
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn report_serializes_with_check_names_in_screaming_case() {
        let mut report = AuditReport::new();
        let mut cross = issue(CheckStatus::Fail);
        cross.check = AuditCheck::CrossTenant;
        report.record(cross);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["issues"][0]["check"], "CROSS_TENANT");
        assert_eq!(json["summary"]["failed"], 1);
        assert!(json["issues"][0].get("details").is_none());
    }
}

//src/main.rs

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use merenda_tenancy::{
    common::tenant::TenantContext,
    config::{AppConfig, AppState},
};

#[derive(Parser)]
#[command(
    name = "merenda",
    about = "Isolamento por tenant, migração de dados legados e conciliação de estoque",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Motor de migração (atribuição de tenant a dados legados)
    #[command(subcommand)]
    Migrate(MigrateCommands),
    /// Auditor de integridade referencial
    #[command(subcommand)]
    Audit(AuditCommands),
    /// Conciliação de estoque (agregado x lotes)
    #[command(subcommand)]
    Estoque(EstoqueCommands),
    /// Schema do próprio banco
    #[command(subcommand)]
    Db(DbCommands),
}

#[derive(Subcommand)]
enum MigrateCommands {
    Run(MigrateRunArgs),
    /// Todas as tabelas registradas, na ordem de dependência
    RunAll(TenantArgs),
    Rollback(RollbackArgs),
    ListBackups,
    /// Apaga uma tabela de backup (irreversível)
    Cleanup(CleanupArgs),
    /// Mostra a ordem de migração das tabelas
    Order,
}

#[derive(Args)]
struct MigrateRunArgs {
    #[arg(long, help = "Tabela escopada a migrar")]
    table: String,
    #[arg(long, help = "Tenant de destino")]
    tenant: Uuid,
    #[arg(long, action = ArgAction::SetTrue, help = "Apenas conta as linhas pendentes")]
    dry_run: bool,
}

#[derive(Args)]
struct TenantArgs {
    #[arg(long)]
    tenant: Uuid,
}

#[derive(Args)]
struct RollbackArgs {
    #[arg(long, conflicts_with = "table", required_unless_present = "table", help = "Id do registro de migração")]
    id: Option<Uuid>,
    #[arg(long, help = "Última migração concluída desta tabela")]
    table: Option<String>,
    #[arg(long, requires = "table", help = "Timestamp do backup (YYYYmmdd_HHMMSS)")]
    backup: Option<String>,
    #[arg(long, action = ArgAction::SetTrue, help = "Não pede confirmação")]
    yes: bool,
}

#[derive(Args)]
struct CleanupArgs {
    #[arg(long, help = "Nome da tabela de backup")]
    backup: String,
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
}

#[derive(Subcommand)]
enum AuditCommands {
    Run(AuditRunArgs),
}

#[derive(Args)]
struct AuditRunArgs {
    #[arg(long, action = ArgAction::SetTrue, help = "Preenche tenant_id quando os pais concordam")]
    fix_minor: bool,
    #[arg(long, help = "Grava o relatório JSON neste arquivo")]
    export: Option<PathBuf>,
}

#[derive(Subcommand)]
enum EstoqueCommands {
    /// Saldo efetivo (soma dos lotes ativos ou agregado)
    Saldo(PairArgs),
    /// Pares com divergência entre agregado e lotes
    Drift(TenantArgs),
    /// Alinha o agregado à soma dos lotes ativos (ajuste auditado)
    Corrigir(CorrigirArgs),
    /// Baixa dos lotes vencidos
    Vencer(VencerArgs),
    /// Lotes com situação de validade
    Lotes(PairArgs),
}

#[derive(Args)]
struct PairArgs {
    #[arg(long)]
    tenant: Uuid,
    #[arg(long)]
    escola: Uuid,
    #[arg(long)]
    produto: Uuid,
}

#[derive(Args)]
struct CorrigirArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    motivo: String,
}

#[derive(Args)]
struct VencerArgs {
    #[arg(long)]
    tenant: Uuid,
    #[arg(long, help = "Data de referência (padrão: hoje)")]
    data: Option<NaiveDate>,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Aplica as migrações SQL de ./migrations
    Migrate,
}

#[tokio::main]
async fn main() {
    // Logs vão para stderr; stdout fica só com o JSON dos comandos.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("🔥 {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::from_env()?;
    let state = AppState::new(&config).await?;

    match cli.command {
        Commands::Migrate(command) => handle_migrate(&state, command).await,
        Commands::Audit(AuditCommands::Run(args)) => handle_audit(&state, args).await,
        Commands::Estoque(command) => handle_estoque(&state, command).await,
        Commands::Db(DbCommands::Migrate) => {
            sqlx::migrate!()
                .run(&state.db_pool)
                .await
                .context("Falha ao rodar as migrações do banco de dados")?;
            tracing::info!("✅ Migrações do banco de dados executadas com sucesso!");
            Ok(0)
        }
    }
}

async fn handle_migrate(state: &AppState, command: MigrateCommands) -> Result<i32> {
    let service = &state.migration_service;

    match command {
        MigrateCommands::Run(args) => {
            let outcome = service.run_migration(&args.table, args.tenant, args.dry_run).await?;
            print_json(&outcome)?;
            Ok(0)
        }
        MigrateCommands::RunAll(args) => {
            let cancel = cancel_on_ctrl_c();
            let results = service.run_all(args.tenant, &cancel).await;
            print_json(&results)?;

            let failed = results.iter().filter(|r| r.error.is_some()).count();
            if failed > 0 {
                tracing::warn!("{} tabela(s) falharam", failed);
            }
            Ok(if failed > 0 || cancel.load(Ordering::SeqCst) { 1 } else { 0 })
        }
        MigrateCommands::Rollback(args) => {
            let record_id = match (args.id, args.table.as_deref()) {
                (Some(id), _) => id,
                (None, Some(table)) => service.find_rollback_target(table, args.backup.as_deref()).await?.id,
                (None, None) => anyhow::bail!("informe --id ou --table"),
            };

            let prompt = format!(
                "O rollback da migração {} substitui o conteúdo da tabela pelo backup.",
                record_id
            );
            if !args.yes && !confirm(&prompt)? {
                tracing::warn!("Rollback abortado pelo operador");
                return Ok(1);
            }

            let record = service.rollback(record_id).await?;
            print_json(&record)?;
            Ok(0)
        }
        MigrateCommands::ListBackups => {
            print_json(&service.list_backups().await?)?;
            Ok(0)
        }
        MigrateCommands::Cleanup(args) => {
            let prompt = format!("A tabela de backup {} será apagada.", args.backup);
            if !args.yes && !confirm(&prompt)? {
                tracing::warn!("Remoção abortada pelo operador");
                return Ok(1);
            }
            service.cleanup_backup(&args.backup).await?;
            Ok(0)
        }
        MigrateCommands::Order => {
            print_json(&service.migration_order())?;
            Ok(0)
        }
    }
}

async fn handle_audit(state: &AppState, args: AuditRunArgs) -> Result<i32> {
    let cancel = cancel_on_ctrl_c();
    let report = state.audit_service.run_full_validation(args.fix_minor, &cancel).await;

    if let Some(path) = &args.export {
        let body = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, body)
            .with_context(|| format!("Falha ao gravar o relatório em {}", path.display()))?;
        tracing::info!("Relatório gravado em {}", path.display());
    }
    print_json(&report)?;

    Ok(if report.cancelled { 1 } else { report.exit_code() })
}

async fn handle_estoque(state: &AppState, command: EstoqueCommands) -> Result<i32> {
    let service = &state.inventory_service;
    let today = Local::now().date_naive();

    match command {
        EstoqueCommands::Saldo(p) => {
            let quantidade = service
                .get_effective_quantity(&TenantContext(p.tenant), p.escola, p.produto)
                .await?;
            print_json(&json!({ "escolaId": p.escola, "produtoId": p.produto, "quantidade": quantidade }))?;
            Ok(0)
        }
        EstoqueCommands::Drift(args) => {
            let reports = service.detect_drift(&TenantContext(args.tenant)).await?;
            print_json(&reports)?;
            Ok(if reports.is_empty() { 0 } else { 1 })
        }
        EstoqueCommands::Corrigir(args) => {
            let p = args.pair;
            let outcome = service
                .correct_drift(&TenantContext(p.tenant), p.escola, p.produto, &args.motivo, today)
                .await?;
            print_json(&outcome)?;
            Ok(0)
        }
        EstoqueCommands::Vencer(args) => {
            let movimentacoes = service
                .expire_lots(&TenantContext(args.tenant), args.data.unwrap_or(today))
                .await?;
            print_json(&movimentacoes)?;
            Ok(0)
        }
        EstoqueCommands::Lotes(p) => {
            let lotes = service
                .list_lots_with_status(&TenantContext(p.tenant), p.escola, p.produto, today)
                .await?;
            print_json(&lotes)?;
            Ok(0)
        }
    }
}

// Ctrl-C só marca o pedido; o trabalho para entre duas tabelas.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Cancelamento solicitado; terminando a tabela atual...");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} Digite SIM para confirmar: ", prompt);
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim() == "SIM")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

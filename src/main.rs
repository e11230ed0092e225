use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use case_sync::{
    AccessControlResolver, AuthTokenManager, Config, DigestNotifier, PostgresStore, Principal,
    ProcessFilter, ProviderClient, QueryService, ReconciliationEngine, Role, WebhookMailer,
};

#[derive(Parser)]
#[command(name = "case-sync")]
#[command(about = "Legal process sync, stage-change digests and scoped queries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, default_value = ".case-sync/config.yml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Pull the provider report and reconcile stored processes
    Sync {
        /// Report id (defaults to provider.report_id)
        #[arg(long)]
        report_id: Option<i64>,
    },

    /// Send the daily stage-change digest
    Digest {
        /// Reference instant, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Search processes visible to a principal
    Search {
        /// Free text over identifiers, case number and alternate code
        term: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long)]
        page_size: Option<usize>,

        #[command(flatten)]
        principal: PrincipalArgs,
    },

    /// Show one process if the principal may see it
    Detail {
        process_id: i64,

        /// Include the provider's live view
        #[arg(long)]
        live: bool,

        #[command(flatten)]
        principal: PrincipalArgs,
    },
}

#[derive(Args)]
struct PrincipalArgs {
    /// Caller role (admin, staff, client, commercial_manager, ...)
    #[arg(long, env = "CASE_SYNC_ROLE")]
    role: String,

    /// Caller email
    #[arg(long, env = "CASE_SYNC_EMAIL")]
    email: String,

    /// Caller's own identifier (NIT or id number)
    #[arg(long)]
    identifier: Option<String>,

    /// Permission strings such as procesos:view_own; role defaults apply when omitted
    #[arg(long = "permission")]
    permissions: Vec<String>,
}

impl PrincipalArgs {
    fn to_principal(&self) -> Result<Principal> {
        let role = Role::parse(&self.role)
            .with_context(|| format!("Unknown role: {}", self.role))?;
        Ok(Principal::from_claims(
            role,
            &self.permissions,
            &self.email,
            self.identifier.as_deref(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("case_sync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Migrate => migrate(&config).await?,
        Commands::Sync { report_id } => sync(&config, report_id).await?,
        Commands::Digest { at } => digest(&config, at.unwrap_or_else(Utc::now)).await?,
        Commands::Search {
            term,
            page,
            page_size,
            principal,
        } => search(&config, term, page, page_size, &principal).await?,
        Commands::Detail {
            process_id,
            live,
            principal,
        } => detail(&config, process_id, live, &principal).await?,
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<Arc<PostgresStore>> {
    let url = config.database.resolve_url()?;
    let store = PostgresStore::connect(&url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    Ok(Arc::new(store))
}

fn provider_client(config: &Config, store: Arc<PostgresStore>) -> ProviderClient {
    let auth = AuthTokenManager::new(&config.provider, store);
    ProviderClient::new(&config.provider.base_url, auth)
}

async fn migrate(config: &Config) -> Result<()> {
    let store = connect(config).await?;
    store.migrate().await.context("Failed to apply migrations")?;
    println!("Migrations applied.");
    Ok(())
}

async fn sync(config: &Config, report_id: Option<i64>) -> Result<()> {
    let report_id = report_id.unwrap_or(config.provider.report_id);
    if report_id <= 0 {
        anyhow::bail!("No report id given and provider.report_id is not configured");
    }

    let store = connect(config).await?;
    let client = provider_client(config, store.clone());
    let engine = ReconciliationEngine::new(store.clone(), store, &config.reconcile);

    let report = engine.sync_report(&client, report_id).await?;

    info!(report_id, "Sync finished");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn digest(config: &Config, at: DateTime<Utc>) -> Result<()> {
    let mailer = WebhookMailer::from_config(&config.digest.mailer)
        .context("Digest mailer is disabled or has no webhook_url")?;

    let store = connect(config).await?;
    let notifier = DigestNotifier::new(
        store.clone(),
        store,
        Arc::new(mailer),
        config.digest.clone(),
    );

    let report = notifier.run(at).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn search(
    config: &Config,
    term: Option<String>,
    page: usize,
    page_size: Option<usize>,
    principal: &PrincipalArgs,
) -> Result<()> {
    let principal = principal.to_principal()?;
    let store = connect(config).await?;
    let service = QueryService::new(
        store.clone(),
        AccessControlResolver::new(store),
        config.query.clone(),
    );

    let result = service
        .list(
            &principal,
            &ProcessFilter {
                text: term,
                page,
                page_size,
            },
        )
        .await?;

    if result.items.is_empty() {
        println!("No visible processes.");
        return Ok(());
    }

    println!(
        "Processes {} of page {} ({} total):\n",
        result.items.len(),
        result.page,
        result.total
    );
    for item in &result.items {
        println!("  #{} {} [{}]", item.process_id, item.case_number, item.client_class);
        println!("    Stage: {}", item.client_stage);
        println!(
            "    Plaintiff: {} ({})",
            item.plaintiff_name, item.plaintiff_identifier
        );
        println!(
            "    Defendant: {} ({})",
            item.defendant_name, item.defendant_identifier
        );
        println!();
    }

    Ok(())
}

async fn detail(
    config: &Config,
    process_id: i64,
    live: bool,
    principal: &PrincipalArgs,
) -> Result<()> {
    let principal = principal.to_principal()?;
    let store = connect(config).await?;

    let mut service = QueryService::new(
        store.clone(),
        AccessControlResolver::new(store.clone()),
        config.query.clone(),
    );
    if live {
        service = service.with_provider(provider_client(config, store));
    }

    let view = service.detail(&principal, process_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

//! Operator CLI for the Tasklane sync layer.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tasklane_core::{
    BrokerDiagnostic, Config, CoreError, CredentialBroker, GroupChange, OrderUpdate, OrderedItem,
    RouteTarget, TenantId, TenantKey, reindex,
};
use tasklane_db::{DbError, DbRegistry, LocalDb, OfflineConnector, RouterConfig};
use tasklane_sync::{
    EnvTokenProvider, RestBackend, SyncError, TableMap, UploadConnector,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "tasklane", version, about = "Tasklane sync layer operator CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show how a tenant routes (credentials redacted).
    Route { tenant: String },
    /// List a tenant's pending transactions.
    Queue { tenant_id: String, tenant_name: String },
    /// Drain a remote tenant's queue once.
    Drain { tenant_id: String, tenant_name: String },
    /// Compute the minimal update set from a `{current, proposed}` file.
    Reindex { file: PathBuf },
    /// Print the effective configuration.
    Config,
}

pub fn run() -> i32 {
    init_tracing();
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignore a second init (tests, embedding).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn execute(cli: Cli) -> CliResult<()> {
    let config = Config::from_env()?;
    let output = match cli.command {
        Commands::Route { tenant } => {
            let broker = CredentialBroker::from_config(&config)?;
            route_report(&broker, &tenant)
        }
        Commands::Queue {
            tenant_id,
            tenant_name,
        } => {
            let runtime = runtime()?;
            let registry = offline_registry(&config)?;
            let (_, handle) =
                runtime.block_on(registry.activate(TenantId::new(tenant_id), &tenant_name))?;
            queue_report(&handle)?
        }
        Commands::Drain {
            tenant_id,
            tenant_name,
        } => handle_drain(&config, TenantId::new(tenant_id), &tenant_name)?,
        Commands::Reindex { file } => reindex_report(&std::fs::read_to_string(file)?)?,
        Commands::Config => config_report(&config),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Registry that opens file-backed handles without going online.
fn offline_registry(config: &Config) -> CliResult<DbRegistry> {
    Ok(DbRegistry::new(
        RouterConfig::from_config(config),
        Arc::new(CredentialBroker::from_config(config)?),
        Arc::new(OfflineConnector),
    ))
}

fn handle_drain(config: &Config, tenant_id: TenantId, tenant_name: &str) -> CliResult<Value> {
    let registry = offline_registry(config)?;
    let RouteTarget::Remote(endpoint) = registry.broker().resolve(tenant_name) else {
        return Err(CliError::InvalidArgument(format!(
            "{tenant_name:?} routes locally; nothing to drain"
        )));
    };
    let backend = RestBackend::new(
        &endpoint.into_connection(tenant_id.clone()),
        config.http_timeout,
    )
    .map_err(SyncError::from)?;
    let upload = UploadConnector::new(
        Arc::new(backend),
        Arc::new(EnvTokenProvider::default()),
        TableMap::from_config(config),
        config.token_template.clone(),
    );

    let runtime = runtime()?;
    let report = runtime.block_on(async {
        let (_, handle) = registry.activate(tenant_id, tenant_name).await?;
        let report = upload.drain(&handle).await?;
        let remaining = handle.pending_count()?;
        Ok::<_, CliError>(json!({ "report": report, "remaining": remaining }))
    })?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Routing decision for `tenant`.
#[must_use]
pub fn route_report(broker: &CredentialBroker, tenant: &str) -> Value {
    let key = TenantKey::normalize(tenant);
    let allow_listed = broker.table().get(&key).is_some();
    let target = broker.resolve(tenant);
    let mut report = json!({
        "tenant": tenant,
        "key": key,
        "allowListed": allow_listed,
        "mode": target.mode(),
    });
    if let RouteTarget::Remote(endpoint) = &target {
        report["endpointUrl"] = json!(endpoint.endpoint_url);
        report["credential"] = json!("<redacted>");
        if let Some(api) = &endpoint.backend_api_url {
            report["backendApiUrl"] = json!(api);
        }
    }
    if let Some(BrokerDiagnostic::MissingSecrets { missing }) = broker.diagnose(tenant) {
        report["diagnostic"] = json!({ "missingSecrets": missing });
    }
    report
}

/// Pending transactions of `db`, oldest first.
pub fn queue_report(db: &LocalDb) -> CliResult<Value> {
    let transactions: Vec<Value> = db
        .pending_transactions()?
        .into_iter()
        .map(|tx| {
            let mutations: Vec<Value> = tx
                .mutations
                .iter()
                .map(|queued| {
                    json!({
                        "seq": queued.seq,
                        "op": queued.mutation.op,
                        "table": queued.mutation.table,
                        "id": queued.mutation.record_id,
                    })
                })
                .collect();
            json!({ "txId": tx.tx_id, "mutations": mutations })
        })
        .collect();
    Ok(json!({
        "handle": db.key().to_string(),
        "pending": db.pending_count()?,
        "transactions": transactions,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReindexInput {
    current: Vec<OrderedItem>,
    #[serde(default)]
    proposed: Option<Vec<OrderUpdate>>,
    #[serde(default, rename = "move")]
    move_item: Option<MoveInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveInput {
    id: String,
    to_index: usize,
    /// Absent keeps the group, `null` ungroups, a string regroups.
    #[serde(default)]
    group_id: Option<Value>,
}

impl MoveInput {
    fn group_change(&self) -> CliResult<GroupChange> {
        match &self.group_id {
            None => Ok(GroupChange::Keep),
            Some(Value::Null) => Ok(GroupChange::To(None)),
            Some(Value::String(group)) => Ok(GroupChange::To(Some(group.clone()))),
            Some(other) => Err(CliError::InvalidArgument(format!(
                "move.groupId must be a string or null, got {other}"
            ))),
        }
    }
}

/// Minimal update set for a reindex input document.
///
/// Accepts either an explicit `proposed` list or a single `move`.
pub fn reindex_report(input: &str) -> CliResult<Value> {
    let input: ReindexInput = serde_json::from_str(input)?;
    let updates = match (&input.proposed, &input.move_item) {
        (Some(proposed), None) => reindex::diff(&input.current, proposed),
        (None, Some(item)) => reindex::reorder(
            &input.current,
            &item.id,
            item.to_index,
            &item.group_change()?,
        )?,
        _ => {
            return Err(CliError::InvalidArgument(
                "exactly one of `proposed` or `move` is required".to_string(),
            ));
        }
    };
    Ok(json!({ "updates": updates }))
}

/// Effective configuration. Contains no secrets.
#[must_use]
pub fn config_report(config: &Config) -> Value {
    let aliases: serde_json::Map<String, Value> = config
        .table_aliases
        .iter()
        .map(|(local, remote)| (local.clone(), json!(remote)))
        .collect();
    json!({
        "dataDir": config.data_dir.display().to_string(),
        "remoteTenants": config.remote_tenants,
        "healthIntervalMs": u64::try_from(config.health_interval.as_millis()).unwrap_or(u64::MAX),
        "healthFailureThreshold": config.health_failure_threshold,
        "maxTransactionMutations": config.max_transaction_mutations,
        "retryBaseMs": u64::try_from(config.retry_base.as_millis()).unwrap_or(u64::MAX),
        "retryMaxMs": u64::try_from(config.retry_max.as_millis()).unwrap_or(u64::MAX),
        "httpTimeoutMs": u64::try_from(config.http_timeout.as_millis()).unwrap_or(u64::MAX),
        "tokenTemplate": config.token_template,
        "tableAliases": aliases,
    })
}

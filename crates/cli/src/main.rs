use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use crossterm::style::Stylize;
use tokio::sync::watch;
use tracing::{info, warn};

use berth_app::{without_app_records, App, ChangeRecord};
use berth_apply::{ApplyOpts, ClusterChangeSet};
use berth_cluster::{ClusterClient, KubeClusterClient};
use berth_config::ConfigBundle;
use berth_core::Resource;
use berth_diff::{Change, ChangeFactory, ChangeOp, ChangeSet, ChangeSetOpts};
use berth_graph::ChangeGraph;

#[derive(Parser, Debug)]
#[command(name = "berth", version, about = "Declarative application lifecycle manager")]
struct Cli {
    /// Namespace holding the application record; also the default namespace
    /// for namespaced resources without one
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy an application from config documents
    Deploy {
        /// Application name
        #[arg(short = 'a', long = "app")]
        app: String,
        /// Input files ("-" reads stdin); multi-document YAML
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<String>,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
        /// Show the change set and stop without applying
        #[arg(long = "diff-run", action = ArgAction::SetTrue)]
        diff_run: bool,
        /// Proceed even when the desired set is empty (deletes everything)
        #[arg(long = "dangerous-allow-empty-set", action = ArgAction::SetTrue)]
        allow_empty: bool,
        /// Older change records beyond this count are garbage collected
        #[arg(long = "app-changes-max-to-keep", default_value_t = 200)]
        changes_max: usize,
    },
    /// Delete an application and every resource it owns
    Delete {
        #[arg(short = 'a', long = "app")]
        app: String,
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// List an application's live resources
    Inspect {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
    /// Show an application's recorded changes
    AppChanges {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
}

// BERTH_LOG holds EnvFilter directives ("debug", "berth_apply=trace,info").
// An unparseable value must not take the whole CLI down, and quieting our
// own output shouldn't require also spelling out every dependency crate.
fn log_filter() -> tracing_subscriber::EnvFilter {
    let spec = match std::env::var("BERTH_LOG") {
        Ok(spec) if !spec.trim().is_empty() => spec,
        _ => return tracing_subscriber::EnvFilter::new("info"),
    };
    tracing_subscriber::EnvFilter::try_new(&spec).unwrap_or_else(|err| {
        eprintln!("BERTH_LOG {:?} is not a valid filter ({}); using \"info\"", spec, err);
        tracing_subscriber::EnvFilter::new("info")
    })
}

fn init_tracing() {
    // Tables and prompts own stdout; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn metrics_listen_addr(raw: &str) -> Result<std::net::SocketAddr, String> {
    raw.trim()
        .parse::<std::net::SocketAddr>()
        .map_err(|e| format!("{:?} is not host:port ({})", raw, e))
}

fn init_metrics() {
    let raw = match std::env::var("BERTH_METRICS_ADDR") {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let addr = match metrics_listen_addr(&raw) {
        Ok(addr) => addr,
        Err(reason) => {
            warn!(%reason, "BERTH_METRICS_ADDR ignored");
            return;
        }
    };
    let install = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install();
    match install {
        Ok(()) => info!(%addr, "serving Prometheus metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter failed to start"),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::try_default().await?);

    match cli.command {
        Commands::Deploy { app, files, yes, diff_run, allow_empty, changes_max } => {
            deploy(client, &cli.namespace, &app, &files, yes, diff_run, allow_empty, changes_max)
                .await
        }
        Commands::Delete { app, yes } => delete(client, &cli.namespace, &app, yes).await,
        Commands::Inspect { app } => inspect(client, &cli.namespace, &app).await,
        Commands::AppChanges { app } => app_changes(client, &cli.namespace, &app).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn deploy(
    client: Arc<dyn ClusterClient>,
    namespace: &str,
    app_name: &str,
    files: &[String],
    yes: bool,
    diff_run: bool,
    allow_empty: bool,
    changes_max: usize,
) -> Result<()> {
    let docs = FileSource { files }.resources()?;
    let (resources, bundle) = ConfigBundle::from_resources(docs)?;

    berth_app::validate_desired(&resources, allow_empty)?;

    let app = App::new(app_name, namespace, client.clone());
    let meta = app.create_or_update(&bundle.additional_labels).await?;

    let mut resources = berth_app::prepare_resources(resources, Some(namespace));
    berth_app::apply_ownership_labels(&mut resources, &meta, &bundle.additional_labels)?;
    let ns_names = namespace_names(&resources);

    let existing = without_app_records(client.list(&meta.selector()).await?);

    let factory = ChangeFactory::new(bundle.clone(), env_flag("BERTH_DEBUG_HISTORY"));
    let changes = ChangeSet::new(
        existing,
        resources,
        &factory,
        ChangeSetOpts { ownership_label: (meta.label_key.clone(), meta.label_value.clone()) },
    )
    .calculate()?;
    let graph = ChangeGraph::build(&changes, &bundle.reference_rules, &bundle.kind_order_overrides)?;

    print_change_set(&changes);
    let actionable = changes.iter().filter(|c| c.op() != ChangeOp::Noop).count();
    if diff_run || actionable == 0 {
        if actionable == 0 {
            println!("Nothing to do.");
        }
        return Ok(());
    }
    if !yes && !confirm()? {
        println!("Deploy cancelled");
        return Ok(());
    }

    let description = format!(
        "update: create={} update={} delete={}",
        changes.iter().filter(|c| c.op() == ChangeOp::Create).count(),
        changes.iter().filter(|c| c.op() == ChangeOp::Update).count(),
        changes.iter().filter(|c| c.op() == ChangeOp::Delete).count(),
    );
    let handle = app
        .begin_change(ChangeRecord {
            description,
            namespaces: ns_names,
            started_at: chrono::Utc::now(),
            finished_at: None,
            successful: None,
        })
        .await?;

    let set = ClusterChangeSet::new(
        changes,
        graph,
        client.clone(),
        Arc::new(factory),
        apply_opts(&bundle),
    );
    let result = set.apply(cancel_on_ctrl_c()).await;

    // Settling the change record and GC are bookkeeping; their errors never
    // change the deploy outcome.
    match result {
        Ok(summary) => {
            if let Err(e) = handle.succeed().await {
                warn!(error = %e, "could not record change success");
            }
            println!("Succeeded. {}", summary);
            gc_app_changes(&app, changes_max).await;
            Ok(())
        }
        Err(err) => {
            if let Err(e) = handle.fail().await {
                warn!(error = %e, "could not record change failure");
            }
            gc_app_changes(&app, changes_max).await;
            Err(anyhow!("{}", err))
        }
    }
}

async fn gc_app_changes(app: &App, max: usize) {
    match app.gc_changes(max, None).await {
        Ok((_, deleted)) if deleted > 0 => println!("Deleted {} older app changes", deleted),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "garbage collecting app changes failed"),
    }
}

async fn delete(
    client: Arc<dyn ClusterClient>,
    namespace: &str,
    app_name: &str,
    yes: bool,
) -> Result<()> {
    let app = App::new(app_name, namespace, client.clone());
    let meta = app.meta().await?;
    let existing = without_app_records(client.list(&meta.selector()).await?);

    let bundle = ConfigBundle::default();
    let factory = ChangeFactory::new(bundle.clone(), env_flag("BERTH_DEBUG_HISTORY"));
    let mut changes = Vec::with_capacity(existing.len());
    for res in &existing {
        changes.push(factory.new_change(Some(res), None)?);
    }
    let graph = ChangeGraph::build(&changes, &bundle.reference_rules, &bundle.kind_order_overrides)?;

    print_change_set(&changes);
    if changes.is_empty() {
        println!("Nothing to delete; removing application record.");
    } else {
        if !yes && !confirm()? {
            println!("Delete cancelled");
            return Ok(());
        }
        let set = ClusterChangeSet::new(
            changes,
            graph,
            client.clone(),
            Arc::new(factory),
            apply_opts(&bundle),
        );
        let summary = set.apply(cancel_on_ctrl_c()).await?;
        println!("Succeeded. {}", summary);
    }

    // Change records go with the application.
    app.gc_changes(0, None).await?;
    app.delete().await?;
    Ok(())
}

async fn inspect(client: Arc<dyn ClusterClient>, namespace: &str, app_name: &str) -> Result<()> {
    let app = App::new(app_name, namespace, client.clone());
    let meta = app.meta().await?;
    let mut existing = without_app_records(client.list(&meta.selector()).await?);
    existing.sort_by_key(|r| r.id());

    println!("{:<20} {:<30} {:<30}", "NAMESPACE", "KIND", "NAME");
    for res in &existing {
        println!(
            "{:<20} {:<30} {:<30}",
            res.namespace().unwrap_or("(cluster)"),
            res.kind(),
            res.name()
        );
    }
    println!("{} resource(s)", existing.len());
    Ok(())
}

async fn app_changes(client: Arc<dyn ClusterClient>, namespace: &str, app_name: &str) -> Result<()> {
    let app = App::new(app_name, namespace, client.clone());
    println!("{:<26} {:<10} {}", "STARTED AT", "RESULT", "DESCRIPTION");
    for (_, record) in app.changes().await? {
        let result = match record.successful {
            Some(true) => "ok",
            Some(false) => "failed",
            None => "open",
        };
        println!("{:<26} {:<10} {}", record.started_at.to_rfc3339(), result, record.description);
    }
    Ok(())
}

/// Source of desired documents; the engine doesn't care where they come
/// from. Files and stdin are what the CLI provides.
trait ResourceSource {
    fn resources(&self) -> Result<Vec<Resource>>;
}

struct FileSource<'a> {
    files: &'a [String],
}

impl ResourceSource for FileSource<'_> {
    fn resources(&self) -> Result<Vec<Resource>> {
        load_documents(self.files)
    }
}

fn load_documents(files: &[String]) -> Result<Vec<Resource>> {
    let mut out = Vec::new();
    for file in files {
        let text = if file == "-" {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)?;
            buf
        } else {
            std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?
        };
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("parsing YAML from {}", file))?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(value)?;
            out.push(Resource::from_value(json).map_err(|e| anyhow!("{}: {}", file, e))?);
        }
    }
    Ok(out)
}

fn namespace_names(resources: &[Resource]) -> Vec<String> {
    resources
        .iter()
        .map(|r| r.namespace().unwrap_or("(cluster)").to_string())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn op_marker(op: ChangeOp) -> String {
    match op {
        ChangeOp::Create => "+".green().to_string(),
        ChangeOp::Update => "~".yellow().to_string(),
        ChangeOp::Delete => "-".red().to_string(),
        ChangeOp::Exists => "?".cyan().to_string(),
        ChangeOp::Noop => " ".to_string(),
    }
}

/// Preview grouped by op; noop changes are computed (they still order
/// dependents) but not shown.
fn print_change_set(changes: &[Change]) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    println!("Changes:");
    for op in [ChangeOp::Create, ChangeOp::Update, ChangeOp::Delete, ChangeOp::Exists] {
        for change in changes.iter().filter(|c| c.op() == op) {
            println!("  {} {}", op_marker(op), change.description());
            if op == ChangeOp::Update {
                for line in change.ops_diff().minimal_string().lines() {
                    println!("      {}", line);
                }
            }
        }
    }
    for change in changes {
        let key = match change.op() {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
            ChangeOp::Noop => "noop",
            ChangeOp::Exists => "exists",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    let summary: Vec<String> =
        counts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    println!("{} change(s): {}", changes.len(), summary.join(" "));
}

fn confirm() -> Result<bool> {
    print!("Continue? [yN]: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn apply_opts(bundle: &ConfigBundle) -> ApplyOpts {
    let parallelism = std::env::var("BERTH_APPLY_PARALLEL")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4);
    ApplyOpts {
        parallelism,
        wait_timeout: bundle.wait.change_timeout,
        global_timeout: bundle.wait.global_timeout,
        wait_poll: bundle.wait.poll_interval,
        ..ApplyOpts::default()
    }
}

fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; waiting for in-flight changes to settle");
            let _ = tx.send(true);
        }
    });
    rx
}

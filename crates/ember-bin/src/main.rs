use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

use ember::hive::MemoryHive;
use ember::plan::{PlanRequest, ProviderAction};
use ember::Engine;
use ember_bundle_types::{parse_manifest, BundleAction};

/// Command line options available through the `ember` cli.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// Path of the bundle manifest to load.
    #[clap(short, long)]
    manifest: PathBuf,

    /// The subcommand to execute.
    #[clap(subcommand)]
    command: Command,

    /// File the in-memory registration hive is loaded from and saved to.
    #[clap(long)]
    hive_file: Option<PathBuf>,

    /// Only print the plan instead of applying it.
    #[clap(long, global = true)]
    dry_run: bool,

    /// Log verbose.
    #[clap(short, long, global = true)]
    verbose: bool,
}

/// Bundle actions supported by the driver.
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Install the bundle.
    Install,
    /// Repair an installed bundle.
    Repair,
    /// Change an installed bundle.
    Modify,
    /// Uninstall the bundle.
    Uninstall,
    /// Cache all payloads without executing packages.
    Cache,
    /// Lay the bundle out to a directory.
    Layout {
        /// Target directory.
        directory: PathBuf,
    },
}

impl Command {
    fn action(&self) -> BundleAction {
        match self {
            Command::Install => BundleAction::Install,
            Command::Repair => BundleAction::Repair,
            Command::Modify => BundleAction::Modify,
            Command::Uninstall => BundleAction::Uninstall,
            Command::Cache => BundleAction::Cache,
            Command::Layout { .. } => BundleAction::Layout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let default_level = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .finish()
        .init();

    let manifest_bytes = fs_err::read(&opt.manifest)
        .with_context(|| format!("failed to read manifest {}", opt.manifest.display()))?;
    let manifest = Arc::new(parse_manifest(&manifest_bytes).context("failed to parse manifest")?);
    tracing::info!(
        bundle = %manifest.registration.display_name,
        version = %manifest.version,
        packages = manifest.chain.len(),
        "loaded manifest"
    );

    let hive = match &opt.hive_file {
        Some(path) if path.is_file() => {
            let json = fs_err::read_to_string(path)?;
            Arc::new(MemoryHive::from_json(&json).context("failed to load hive file")?)
        }
        _ => Arc::new(MemoryHive::new()),
    };

    let mut engine = Engine::builder(Arc::clone(&manifest))
        .with_hive(hive.clone())
        .finish();

    engine.run_searches();
    let detection = engine.detect()?;
    for (package_id, detected) in &detection.packages {
        tracing::info!(package = %package_id, state = %detected.state, "detected");
    }

    let mut request = PlanRequest::new(opt.command.action());
    if let Command::Layout { directory } = &opt.command {
        request.layout_directory = Some(directory.clone());
    }
    let plan = engine.plan(&detection, &request)?;

    print_plan(&plan);

    if opt.dry_run {
        return Ok(());
    }

    let result = engine.apply(&plan).await?;
    tracing::info!(
        executed = result.executed_packages.len(),
        restart = ?result.restart,
        "apply complete"
    );

    if let Some(path) = &opt.hive_file {
        fs_err::write(path, hive.to_json()?)?;
    }

    Ok(())
}

fn print_plan(plan: &ember::Plan) {
    println!("plan: {:?}, per-machine: {}", plan.action, plan.per_machine);
    println!("cache actions:");
    for action in plan.live_cache_actions() {
        println!("  {action:?}");
    }
    println!("execute actions:");
    for action in plan.live_execute_actions() {
        match action {
            ember::plan::ExecuteAction::PackageProvider {
                package_id,
                provider_key,
                action,
            } => {
                let verb = match action {
                    ProviderAction::Register => "register",
                    ProviderAction::Unregister => "unregister",
                };
                println!("  provider {verb}: {package_id} ({provider_key})");
            }
            other => println!("  {other:?}"),
        }
    }
}

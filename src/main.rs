//! stackdiff CLI entrypoint.
//!
//! This is the main entrypoint for the stackdiff command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackdiff::apply::Applier;
use stackdiff::backend::{HttpBackend, ProvisioningBackend, SimulatedBackend};
use stackdiff::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackdiff::config::{
    ProvisionerConfig, ProvisionerKind, StackFile, StackParser, StateBackend, find_stack_file,
};
use stackdiff::error::{ConfigError, GraphError, Result, StackError};
use stackdiff::graph::{GraphValidator, ResourceGraph};
use stackdiff::planner::{CancelHandle, ChangePlan, DiffEngine};
use stackdiff::state::{LocalStateStore, S3StateStore, StateStore, generate_holder_id};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Starter stack file written by `stackdiff init`.
const STACK_TEMPLATE: &str = r"# stackdiff stack file
stack:
  name: blog
  state:
    backend: local
    path: .stackdiff
  provisioner:
    backend: simulate

resources:
  - id: net1
    kind: NETWORK
    properties:
      cidr: 10.0.0.0/16

  - id: web1
    kind: INSTANCE
    properties:
      network: net1
      size: t2.small
      public_port: 443

  - id: db1
    kind: DATABASE
    properties:
      network: net1
      engine: postgres
      size: db.t3.small

  - id: rule1
    kind: ACCESS_RULE
    properties:
      source: web1
      target: db1
      port: 5432
";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate => cmd_validate(config, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, max_attempts } => {
            cmd_apply(config, yes, max_attempts, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Write a starter stack file.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let stack_path = path.join("stackdiff.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && stack_path.exists() {
        eprintln!("Stack file already exists: {}", stack_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&stack_path, STACK_TEMPLATE)?;
    eprintln!("Created: {}", stack_path.display());

    let ignored = [".env", ".stackdiff/"];
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = ignored
            .iter()
            .copied()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackdiff")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ignored.join("\n") + "\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackdiff.yaml with your resources");
    eprintln!("  2. Run 'stackdiff validate' to check the declarations");
    eprintln!("  3. Run 'stackdiff plan' to see what will change");
    eprintln!("  4. Run 'stackdiff apply' to converge the stack");

    Ok(())
}

/// Build and validate the declared graph.
fn cmd_validate(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (_, file) = load_stack(config_path)?;
    let graph = file.build_graph()?;

    let issues = GraphValidator::new().validate(&graph);
    println!("{}", formatter.format_issues(&issues));

    if issues.is_empty() {
        info!(
            "Stack '{}' is valid ({} resources)",
            file.stack.name,
            graph.len()
        );
        Ok(())
    } else {
        Err(StackError::Graph(GraphError::ValidationFailed { issues }))
    }
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (_, file) = load_stack(config_path)?;
    let graph = file.build_graph()?;
    println!("{}", formatter.format_graph(&graph));
    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (base_dir, file) = load_stack(config_path)?;
    let graph = build_valid_graph(&file, formatter)?;
    let store = create_state_store(&file, &base_dir).await?;

    let previous = store.load(&file.stack.name).await?;
    let plan = ChangePlan::compute(&file.stack.name, &graph, previous.as_ref())?;

    let diff = if detailed {
        Some(DiffEngine::new().compute_diff(&graph, previous.as_ref().map(|s| &s.resources))?)
    } else {
        None
    };

    println!("{}", formatter.format_plan(&plan, diff.as_ref()));
    Ok(())
}

/// Apply the change plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    max_attempts: u32,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (base_dir, file) = load_stack(config_path)?;
    let graph = build_valid_graph(&file, formatter)?;
    let store = create_state_store(&file, &base_dir).await?;
    let backend = create_backend(&file.stack.provisioner)?;
    let stack = file.stack.name.as_str();

    let applier = Applier::new(&store, &backend)
        .with_max_attempts(max_attempts)
        .with_cancel(cancel_on_ctrl_c());

    let preview = applier.preview(stack, &graph).await?;
    if preview.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&preview, None));
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let report = applier.apply_approved(stack, &graph, &preview).await?;
    println!("{}", formatter.format_report(&report));
    report.into_result().map(|_| ())
}

/// Delete every resource of the stack.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (base_dir, file) = load_stack(config_path)?;
    let store = create_state_store(&file, &base_dir).await?;
    let backend = create_backend(&file.stack.provisioner)?;
    let stack = file.stack.name.as_str();

    let applier = Applier::new(&store, &backend).with_cancel(cancel_on_ctrl_c());

    let preview = applier.preview(stack, &ResourceGraph::empty()).await?;
    if preview.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&preview, None));
    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let report = applier.destroy_approved(stack, &preview).await?;
    println!("{}", formatter.format_report(&report));
    report.into_result().map(|_| ())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (base_dir, file) = load_stack(config_path)?;
    let store = create_state_store(&file, &base_dir).await?;
    let stack = file.stack.name.as_str();

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load(stack).await? {
                let lock = store.get_lock_info(stack).await?;
                println!("{}", formatter.format_state(&state, lock.as_ref()));
            } else {
                eprintln!("No state found for stack '{stack}'.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(stack, &holder).await?;
            eprintln!("Stack locked: {} (held by {})", lock.lock_id, lock.holder);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock(stack).await?;
                eprintln!("Stack forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(stack, &id).await?;
                eprintln!("Stack unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_stack_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_stack_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env`, the stack file and environment overrides. Returns the
/// directory of the stack file alongside it.
fn load_stack(config_path: Option<&Path>) -> Result<(PathBuf, StackFile)> {
    let stack_path = resolve_stack_path(config_path)?;
    debug!("Loading stack file from: {}", stack_path.display());

    let base_dir = stack_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = StackParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let file = parser.load_with_env(&stack_path)?;
    file.stack.check()?;

    Ok((base_dir, file))
}

/// Builds the graph and fails with the formatted issue list if it is invalid.
fn build_valid_graph(file: &StackFile, formatter: &OutputFormatter) -> Result<ResourceGraph> {
    let graph = file.build_graph()?;
    let issues = GraphValidator::new().validate(&graph);
    if !issues.is_empty() {
        eprintln!("{}", formatter.format_issues(&issues));
        return Err(StackError::Graph(GraphError::ValidationFailed { issues }));
    }
    Ok(graph)
}

/// Creates the state store configured for the stack.
async fn create_state_store(file: &StackFile, base_dir: &Path) -> Result<Box<dyn StateStore>> {
    let state = &file.stack.state;
    let store: Box<dyn StateStore> = match state.backend {
        StateBackend::Local => Box::new(LocalStateStore::with_base_dir(
            base_dir.join(state.local_dir()),
        )),
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 bucket not configured", "stack.state.bucket")
            })?;
            Box::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the provisioning backend configured for the stack.
fn create_backend(config: &ProvisionerConfig) -> Result<Box<dyn ProvisioningBackend>> {
    match config.backend {
        ProvisionerKind::Simulate => {
            warn!("Using the simulate provisioner: no real resources will be changed");
            Ok(Box::new(SimulatedBackend::new()))
        }
        ProvisionerKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                ConfigError::validation(
                    "Provisioner endpoint not configured",
                    "stack.provisioner.endpoint",
                )
            })?;
            let backend =
                HttpBackend::new(endpoint, StackParser::provisioner_token(), config.timeout_secs)?;
            Ok(Box::new(backend))
        }
    }
}

/// Returns a handle that is cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            trigger.cancel();
        }
    });
    cancel
}

/// Asks for confirmation on stderr. True if the answer equals `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

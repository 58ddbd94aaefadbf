use attractor_engine::{
    AttrValue, AutoApproveInterviewer, ConsoleInterviewer, Diagnostic, EngineError, EventBus,
    Interviewer, PipelineRunner, RunEvent, RunEventKind, RunOptions, RunStatus, Severity,
    builtin_registry, load_pipeline,
};
use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Run, validate, and serve agentic pipeline graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a pipeline graph file.
    Run(RunArgs),
    /// Parse and validate a pipeline graph file.
    Validate(ValidateArgs),
    /// Start the HTTP control plane.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    file: PathBuf,
    /// Dry-run with no LLM backend; codergen stages emit simulated output.
    #[arg(long, action = ArgAction::SetTrue)]
    simulate: bool,
    /// Answer every human gate with its first choice.
    #[arg(long, action = ArgAction::SetTrue)]
    auto_approve: bool,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Default llm_provider for nodes the stylesheet leaves unset.
    #[arg(long)]
    provider: Option<String>,
    /// Default llm_model for nodes the stylesheet leaves unset.
    #[arg(long)]
    model: Option<String>,
    /// Pipeline variable override, repeatable: --set key=value
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// Resume from the checkpoint found in this logs directory.
    #[arg(long)]
    resume_from: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    file: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, default_value_t = 7700)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::Serve(args) => serve_command(args).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_command(args: RunArgs) -> ExitCode {
    let (graph, diagnostics) = match load_graph(&args.file, &args.set) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    print_diagnostics(&diagnostics);

    let mut graph = graph;
    if let Some(model) = args.model.as_deref() {
        for node in graph.nodes.values_mut() {
            if !node.attrs.is_explicit("llm_model") {
                node.attrs
                    .set_inherited("llm_model", AttrValue::String(model.to_string()));
            }
        }
    }
    if let Some(provider) = args.provider.as_deref() {
        for node in graph.nodes.values_mut() {
            if !node.attrs.is_explicit("llm_provider") {
                node.attrs
                    .set_inherited("llm_provider", AttrValue::String(provider.to_string()));
            }
        }
    }

    if !args.simulate {
        tracing::warn!("no LLM backend is wired into this host; running in simulate mode");
    }
    let interviewer: Arc<dyn Interviewer> = if args.auto_approve {
        Arc::new(AutoApproveInterviewer)
    } else {
        Arc::new(ConsoleInterviewer)
    };
    let runner = PipelineRunner::new(builtin_registry(None, interviewer));

    let logs_root = args
        .logs_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("attractor-logs").join(&graph.id));
    let events = EventBus::new();
    events.subscribe(Arc::new(print_event));

    let options = RunOptions {
        logs_root: Some(logs_root),
        resume_from: args.resume_from,
        events,
        ..RunOptions::default()
    };
    match runner.run(&graph, options).await {
        Ok(result) => {
            println!(
                "pipeline '{}' finished: {}",
                graph.id,
                result.status.as_str()
            );
            if let Some(reason) = result.failure_reason.as_deref() {
                println!("  reason: {reason}");
            }
            if result.status == RunStatus::Fail {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(error) => {
            eprintln!("run error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn validate_command(args: ValidateArgs) -> ExitCode {
    match load_graph(&args.file, &[]) {
        Ok((graph, diagnostics)) => {
            print_diagnostics(&diagnostics);
            println!(
                "{}: {} node(s), {} edge(s), ok",
                graph.id,
                graph.nodes.len(),
                graph.edges.len()
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

async fn serve_command(args: ServeArgs) -> ExitCode {
    let addr = SocketAddr::new(args.host, args.port);
    match attractor_server::serve(addr).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("serve error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn load_graph(
    file: &PathBuf,
    overrides: &[String],
) -> Result<(attractor_engine::Graph, Vec<Diagnostic>), ExitCode> {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("cannot read '{}': {error}", file.display());
            return Err(ExitCode::FAILURE);
        }
    };

    let mut vars = BTreeMap::new();
    for entry in overrides {
        match entry.split_once('=') {
            Some((key, value)) => {
                vars.insert(key.trim().to_string(), value.to_string());
            }
            None => {
                eprintln!("--set expects KEY=VALUE, got '{entry}'");
                return Err(ExitCode::FAILURE);
            }
        }
    }

    match load_pipeline(&source, Some(file.as_path()), vars) {
        Ok(loaded) => Ok(loaded),
        Err(EngineError::Validation(failure)) => {
            print_diagnostics(&failure.diagnostics);
            eprintln!(
                "validation failed with {} error(s)",
                failure.error_count
            );
            Err(ExitCode::FAILURE)
        }
        Err(error) => {
            eprintln!("{error}");
            Err(ExitCode::FAILURE)
        }
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let severity = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let place = diagnostic
            .node_id
            .as_deref()
            .map(|node| format!(" (node '{node}')"))
            .or_else(|| {
                diagnostic
                    .edge
                    .as_ref()
                    .map(|(from, to)| format!(" (edge '{from}' -> '{to}')"))
            })
            .unwrap_or_default();
        eprintln!(
            "[{}] {severity}: {}{place}",
            diagnostic.rule, diagnostic.message
        );
    }
}

fn print_event(event: &RunEvent) {
    match &event.kind {
        RunEventKind::StageStarted { node_id, attempt } => {
            if *attempt == 1 {
                println!("-> {node_id}");
            } else {
                println!("-> {node_id} (attempt {attempt})");
            }
        }
        RunEventKind::StageCompleted {
            node_id, status, ..
        } => println!("   {node_id}: {status}"),
        RunEventKind::StageFailed { node_id, reason, .. } => {
            println!("   {node_id}: fail ({reason})")
        }
        RunEventKind::StageRetrying {
            node_id, delay_ms, ..
        } => println!("   {node_id}: retrying in {delay_ms}ms"),
        RunEventKind::LoopRestarted { target_node, .. } => {
            println!("   loop restart -> {target_node}")
        }
        RunEventKind::InterviewStarted { node_id } => {
            println!("   waiting on human gate '{node_id}'")
        }
        _ => {}
    }
}

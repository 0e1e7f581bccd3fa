//! Crucible CLI
//!
//! A command-line tool for discovering toolchains, compiling code and
//! running the results locally or on execution workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crucible::{
    ArtifactStore, CompilationQueue, CompilationService, CompileRequest, CompilerRegistry, Config,
    EXAMPLE_CONFIG, ExecutionParams, ExecutionWorker, Executor, HealthCheck, InMemoryQueue,
    ProcessExecutor, RemoteExecutionQueue,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "A tool for compiling and executing code against discovered toolchains")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Load compilers from a discovery snapshot instead of probing
    #[arg(short, long, global = true)]
    prediscovered: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: crucible.toml)
        #[arg(short, long, default_value = "crucible.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Probe configured compilers and optionally save the snapshot
    Discover {
        /// Write the discovery snapshot to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List discovered compilers
    Compilers {
        /// Only show compilers for this language
        #[arg(short, long)]
        lang: Option<String>,
    },

    /// Compile a source file and optionally execute the result
    Compile {
        /// Source file to compile
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language key (e.g., c++, rust, go)
        #[arg(short, long)]
        lang: String,

        /// Compiler ID (e.g., gcc-12)
        #[arg(long)]
        compiler: String,

        /// Extra compiler flags (repeatable)
        #[arg(short = 'O', long, alias = "option", allow_hyphen_values = true)]
        options: Vec<String>,

        /// Execute the produced binary
        #[arg(short = 'x', long)]
        execute: bool,

        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Print the readiness report
    Health,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using example configuration");
        Config::example().context("failed to parse example configuration")?
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Discover { output } => run_discover(&config, cli.prediscovered.as_deref(), output.as_deref()).await,
        Commands::Compilers { lang } => {
            let registry = start_registry(&config, cli.prediscovered.as_deref()).await?;
            list_compilers(&registry, lang.as_deref());
            Ok(())
        }
        Commands::Compile {
            source,
            lang,
            compiler,
            options,
            execute,
            stdin,
            args,
        } => {
            let stdin = match stdin {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .context("failed to read stdin file")?,
                ),
                None => None,
            };
            let source = tokio::fs::read_to_string(&source)
                .await
                .context("failed to read source file")?;

            let request = CompileRequest {
                lang,
                compiler_id: compiler,
                source,
                options,
                execute: execute.then(|| ExecutionParams {
                    args,
                    stdin,
                }),
            };

            let runtime = Runtime::start(&config, cli.prediscovered.as_deref()).await?;
            let code = run_compile(&runtime, request).await;
            runtime.shutdown().await;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Health => {
            let runtime = Runtime::start(&config, cli.prediscovered.as_deref()).await?;
            runtime.wait_for_worker().await;
            let report = runtime.health.check();
            println!("{}", serde_json::to_string_pretty(&report)?);
            runtime.shutdown().await;
            if !report.ready {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

/// Every long-lived component of a running host
struct Runtime {
    service: Arc<CompilationService>,
    health: HealthCheck,
    worker: Option<Arc<ExecutionWorker>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    async fn start(config: &Config, prediscovered: Option<&Path>) -> Result<Self> {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        let registry = start_registry(config, prediscovered).await?;
        if let Some(interval) = config.registry.rescan_interval() {
            if prediscovered.is_some() {
                debug!("started from prediscovered compilers, periodic rescans disabled");
            } else {
                tasks.push(registry.clone().spawn_rescan_loop(interval, token.clone()));
            }
        }

        let queue = Arc::new(CompilationQueue::from_config(&config.queue));
        let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::from_config(&config.execution));
        let backend = Arc::new(InMemoryQueue::new());
        let remote = Arc::new(RemoteExecutionQueue::new(backend.clone(), config.remote.clone()));

        let service = Arc::new(
            CompilationService::new(registry.clone(), queue.clone(), executor.clone(), config)
                .with_remote(remote),
        );
        tasks.push(service.spawn_cache_invalidation(token.clone()));

        let mut health = HealthCheck::new(queue, registry, &config.health);
        let worker = if config.worker.is_worker {
            let worker = Arc::new(ExecutionWorker::new(
                backend,
                executor,
                ArtifactStore::new(&config.execution.artifact_dir),
                config.worker.clone(),
                &config.remote,
            ));
            info!(worker_id = worker.id(), specialty = %worker.specialty(), "starting execution worker");
            health = health.with_worker(worker.status(), config.worker.registration_ttl());

            let running = worker.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = running.run(token).await {
                    warn!(error = %e, "execution worker stopped");
                }
            }));
            Some(worker)
        } else {
            None
        };

        Ok(Self {
            service,
            health,
            worker,
            token,
            tasks,
        })
    }

    /// Give an in-process worker a moment to register before reporting on it
    async fn wait_for_worker(&self) {
        let Some(worker) = &self.worker else {
            return;
        };
        for _ in 0..20 {
            if worker.status().is_registered() && worker.status().last_poll_age().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

async fn start_registry(config: &Config, prediscovered: Option<&Path>) -> Result<Arc<CompilerRegistry>> {
    let registry = Arc::new(CompilerRegistry::new(
        config.registry.clone(),
        config.compilers.clone(),
    ));

    let snapshot = match prediscovered {
        Some(path) => {
            info!(?path, "loading prediscovered compilers");
            registry
                .load_prediscovered_file(path)
                .await
                .context("failed to load prediscovered compilers")?
        }
        None => registry
            .initialize(config.worker.is_worker)
            .await
            .context("compiler discovery failed")?,
    };
    info!(compilers = snapshot.len(), "compilers ready");
    Ok(registry)
}

async fn run_discover(config: &Config, prediscovered: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let registry = start_registry(config, prediscovered).await?;
    list_compilers(&registry, None);

    if let Some(output) = output {
        registry
            .export_to_file(output)
            .await
            .context("failed to write discovery snapshot")?;
        println!("\nWrote discovery snapshot to '{}'", output.display());
    }
    Ok(())
}

async fn run_compile(runtime: &Runtime, request: CompileRequest) -> i32 {
    let response = match runtime.service.handle(request).await {
        Ok(response) => response,
        Err(e) => {
            let failure = e.to_failure();
            match serde_json::to_string_pretty(&failure) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{e}"),
            }
            return 2;
        }
    };

    if !response.stdout.is_empty() {
        println!("{}", response.stdout);
    }
    if !response.stderr.is_empty() {
        eprintln!("{}", response.stderr);
    }
    info!(
        compiler = %response.compiler,
        code = response.code,
        cached = response.cached,
        compile_ms = response.timing.compile_ms,
        "compilation finished"
    );

    if response.code != 0 {
        return 1;
    }

    let Some(execution) = response.execution else {
        return 0;
    };

    print!("{}", execution.result.stdout);
    if !execution.result.stderr.is_empty() {
        eprint!("{}", execution.result.stderr);
    }

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        executed_by = %execution.executed_by,
        status = ?execution.result.status,
        wall_time = format_args!("{}ms", execution.result.wall_time_ms),
        exit_code = execution.result.exit_code,
        signal = execution.result.signal,
        truncated = execution.result.truncated,
        "execution result"
    );

    if execution.result.is_success() {
        0
    } else {
        execution.result.exit_code.unwrap_or(1)
    }
}

fn list_compilers(registry: &CompilerRegistry, lang: Option<&str>) {
    let snapshot = registry.snapshot();
    let mut languages: Vec<&str> = snapshot
        .compilers()
        .iter()
        .map(|info| info.lang.as_str())
        .filter(|l| lang.is_none_or(|wanted| wanted == *l))
        .collect();
    languages.sort_unstable();
    languages.dedup();

    if languages.is_empty() {
        println!("No compilers found");
        return;
    }

    for language in languages {
        println!("{language}:");
        for info in snapshot.for_language(language) {
            println!(
                "  {:<20} {:<28} {:<12} {}",
                info.id,
                info.name,
                info.semver.as_deref().unwrap_or("-"),
                info.specialty
            );
        }
    }
}

fn show_config(config: &Config) {
    println!("Registry:");
    println!("  Strict clash: {}", config.registry.strict_clash);
    println!("  Probe concurrency: {}", config.registry.probe_concurrency);
    println!("  Probe timeout: {:?}", config.registry.probe_timeout());
    println!("  Rescan interval: {:?}", config.registry.rescan_interval());
    println!();
    println!("Compilation queue:");
    println!("  Max concurrent: {}", config.queue.concurrency());
    println!("  Queue timeout: {:?}", config.queue.queue_timeout());
    println!("  Kill timeout: {:?}", config.queue.kill_timeout());
    println!();
    println!("Remote execution:");
    println!("  Max wait: {:?}", config.remote.max_wait());
    println!("  Visibility timeout: {:?}", config.remote.visibility_timeout());
    println!("  Message TTL: {:?}", config.remote.message_ttl());
    println!("  Max depth per specialty: {}", config.remote.max_depth_per_specialty);
    println!("  Max receive count: {}", config.remote.max_receive_count);
    println!();
    println!("Execution:");
    println!("  Local: {}", config.execution.local);
    println!("  Worker: {}", config.worker.is_worker);
    println!("  Artifact dir: {}", config.execution.artifact_dir.display());
    println!();
    println!("Compilers configured: {}", config.compilers.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

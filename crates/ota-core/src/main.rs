//! OTA Update Core - update daemon and operator CLI
//!
//! The main entry point for ota-core, handling:
//! - The update daemon (`run`): boot reconciliation, image launch, RPC, event loop
//! - Operator commands against the slot directory (`status`, `commit`, `revert`)
//! - Configuration inspection (`config show|schema|validate`)

use clap::{Args, Parser, Subcommand};
use ota_common::error::format_error_human;
use ota_common::{Error, OutputFormat, StructuredError, UpdateStatus, SCHEMA_VERSION};
use ota_core::config::{load_config, ConfigOptions, OtaConfig, ResolvedConfig};
use ota_core::exit_codes::ExitCode;
use ota_core::host::{
    DirStore, FetchRequest, Fetcher, Host, HttpFetcher, ImageLoader, LoadError,
    ProcessLauncher,
};
use ota_core::log_event;
use ota_core::logging::{
    event_names, generate_run_id, get_host_id, init_logging, LogConfig, LogContext, LogFormat,
    LogLevel, Stage,
};
use ota_core::rpc::server::RpcServer;
use ota_core::runtime::{EventLoop, LoopExit, RestartLatch, TimerQueue};
use ota_core::update::{RevertOutcome, StatusReport};
use ota_core::{Updater, UpdaterSettings};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;

/// OTA Update Core - staged image updates with confirmation and rollback
#[derive(Parser)]
#[command(name = "ota-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to ota.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the slot directory
    #[arg(long, global = true, env = "OTA_SLOT_DIR")]
    slot_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the update daemon
    Run,
    /// Show the stored update state
    Status,
    /// Confirm the running image
    Commit,
    /// Roll back the pending update
    Revert,
    /// Inspect configuration
    Config(ConfigArgs),
    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the resolved configuration and where it came from
    Show,
    /// Print the JSON schema of ota.json
    Schema,
    /// Validate a configuration file
    Validate {
        /// File to validate (defaults to the resolved config)
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Clean
            };
            std::process::exit(code.as_i32());
        }
    };

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let exit_code = match &cli.command {
        Commands::Run => run_daemon(&cli.global),
        Commands::Status => run_status(&cli.global),
        Commands::Commit => run_commit(&cli.global),
        Commands::Revert => run_revert(&cli.global),
        Commands::Config(args) => run_config(&cli.global, args),
        Commands::Version => print_version(&cli.global),
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Daemon
// ============================================================================

fn run_daemon(global: &GlobalOpts) -> ExitCode {
    let resolved = match load(global) {
        Ok(resolved) => resolved,
        Err(e) => return output_error(global, &e),
    };
    let config = &resolved.config;

    let ctx = LogContext::new(generate_run_id(), get_host_id());
    let _span = ctx.span().entered();

    let source = resolved.source.to_string();
    log_event!(
        ctx,
        INFO,
        event_names::CONFIG_LOADED,
        Stage::Init,
        "configuration loaded",
        source = source.as_str(),
        hash = resolved.hash.as_deref().unwrap_or("defaults")
    );

    match serve(&ctx, config) {
        Ok(LoopExit::Restart) => restart_process(&ctx),
        Ok(LoopExit::Shutdown) => {
            log_event!(ctx, INFO, event_names::DAEMON_STOPPED, Stage::Runtime, "daemon stopped");
            ExitCode::Clean
        }
        Err(e) => {
            log_event!(
                ctx,
                ERROR,
                event_names::INTERNAL_ERROR,
                Stage::Runtime,
                "daemon failed",
                code = e.code() as u64
            );
            output_error(global, &e)
        }
    }
}

/// Boot, serve RPC and run the event loop until it exits.
fn serve(ctx: &LogContext, config: &OtaConfig) -> Result<LoopExit, Error> {
    let store = DirStore::open(&config.slot_dir)?;
    let timers = TimerQueue::new();
    let latch = RestartLatch::new();
    let (events, inbox) = mpsc::channel();

    let fetcher = HttpFetcher::new(store.clone(), &config.fetch, events.clone());
    let mut launcher = ProcessLauncher::new(store.root(), config.launcher.clone());

    // Requests queue on the channel until boot has finished.
    let server = if config.rpc.enabled {
        let server = RpcServer::start(&config.rpc, events)?;
        launcher = launcher.with_rpc_addr(server.addr().to_string());
        Some(server)
    } else {
        drop(events);
        None
    };

    let host = Host {
        store: &store,
        scheduler: &timers,
        rebooter: &latch,
        fetcher: &fetcher,
        loader: &launcher,
    };
    let updater = Updater::new(host, UpdaterSettings::from(config));

    let outcome = format!("{:?}", updater.boot()?);
    log_event!(
        ctx,
        INFO,
        event_names::DAEMON_STARTED,
        Stage::Init,
        "daemon started",
        boot = outcome.as_str(),
        rpc_enabled = server.is_some(),
        watchdog_secs = config.watchdog_delay_secs
    );

    let exit = EventLoop::new(inbox, &timers, &latch).run(&updater);

    if let Some(server) = server {
        server.shutdown();
    }
    launcher.stop();
    Ok(exit)
}

/// Replace the current process with a fresh copy of itself.
#[cfg(unix)]
fn restart_process(ctx: &LogContext) -> ExitCode {
    use std::os::unix::process::CommandExt;

    log_event!(ctx, INFO, event_names::DAEMON_STOPPED, Stage::Runtime, "restarting");
    let err = match std::env::current_exe() {
        Ok(exe) => std::process::Command::new(exe)
            .args(std::env::args_os().skip(1))
            .exec(),
        Err(e) => e,
    };
    let error = err.to_string();
    log_event!(
        ctx,
        ERROR,
        event_names::INTERNAL_ERROR,
        Stage::Runtime,
        "re-exec failed; leaving restart to the supervisor",
        error = error.as_str()
    );
    ExitCode::RestartRequired
}

#[cfg(not(unix))]
fn restart_process(ctx: &LogContext) -> ExitCode {
    log_event!(ctx, INFO, event_names::DAEMON_STOPPED, Stage::Runtime, "exiting for restart");
    ExitCode::RestartRequired
}

// ============================================================================
// Operator commands
// ============================================================================

/// Fetcher for one-shot commands, which never start updates.
struct NoFetch;

impl Fetcher for NoFetch {
    fn fetch(&self, _request: FetchRequest) {}
}

/// Loader for one-shot commands; the image belongs to the daemon.
struct NoLaunch;

impl ImageLoader for NoLaunch {
    fn load(&self, name: &str) -> Result<(), LoadError> {
        Err(LoadError::NotFound {
            name: name.to_string(),
        })
    }
}

/// Run `op` against the slot directory without a daemon.
fn with_updater<T>(
    global: &GlobalOpts,
    op: impl FnOnce(&Updater<'_>, &RestartLatch) -> Result<T, Error>,
) -> Result<T, Error> {
    let resolved = load(global)?;
    let store = DirStore::open(&resolved.config.slot_dir)?;
    let timers = TimerQueue::new();
    let latch = RestartLatch::new();
    let host = Host {
        store: &store,
        scheduler: &timers,
        rebooter: &latch,
        fetcher: &NoFetch,
        loader: &NoLaunch,
    };
    let updater = Updater::new(host, UpdaterSettings::from(&resolved.config));
    op(&updater, &latch)
}

fn run_status(global: &GlobalOpts) -> ExitCode {
    let report = match with_updater(global, |updater, _| updater.status()) {
        Ok(report) => report,
        Err(e) => return output_error(global, &e),
    };

    let result = match global.format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Summary => {
            println!("{}", status_summary(&report));
            Ok(())
        }
        OutputFormat::Exitcode => Ok(()),
        OutputFormat::Md => {
            print_status_md(&report);
            Ok(())
        }
    };
    if let Err(e) = result {
        return output_error(global, &e);
    }

    match report.status {
        UpdateStatus::Pending => ExitCode::UpdatePending,
        UpdateStatus::Committed | UpdateStatus::Unrecognized => ExitCode::Clean,
    }
}

fn status_summary(report: &StatusReport) -> String {
    format!(
        "status={} files={} active={}{} backup={}",
        report.status,
        report.files.len(),
        report.active_image,
        if report.active_present { "" } else { " (missing)" },
        if report.backup_present { "yes" } else { "no" },
    )
}

fn print_status_md(report: &StatusReport) {
    println!("# ota-core status");
    println!();
    println!("Status: **{}**", report.status);
    println!(
        "Active image: {}{}",
        report.active_image,
        if report.active_present { "" } else { " (missing)" }
    );
    println!(
        "Backup present: {}",
        if report.backup_present { "yes" } else { "no" }
    );
    if !report.files.is_empty() {
        println!();
        println!("## Pending files");
        for pair in &report.files {
            println!("- {}", pair);
        }
    }
}

#[derive(Serialize)]
struct CommandResult<'a, T: Serialize> {
    schema_version: &'static str,
    generated_at: String,
    command: &'a str,
    result: &'a str,
    restart_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<T>,
}

fn print_result<T: Serialize>(
    global: &GlobalOpts,
    command: &str,
    result: &str,
    restart_required: bool,
    detail: Option<T>,
) -> Result<(), Error> {
    match global.format {
        OutputFormat::Json => print_json(&CommandResult {
            schema_version: SCHEMA_VERSION,
            generated_at: chrono::Utc::now().to_rfc3339(),
            command,
            result,
            restart_required,
            detail,
        }),
        OutputFormat::Summary => {
            println!(
                "{}: {}{}",
                command,
                result,
                if restart_required { " (restart required)" } else { "" }
            );
            Ok(())
        }
        OutputFormat::Exitcode => Ok(()),
        OutputFormat::Md => {
            println!("# ota-core {}", command);
            println!();
            println!("{}", result);
            if restart_required {
                println!();
                println!("Restart the daemon to load the restored image.");
            }
            Ok(())
        }
    }
}

fn run_commit(global: &GlobalOpts) -> ExitCode {
    if let Err(e) = with_updater(global, |updater, _| updater.commit()) {
        return output_error(global, &e);
    }
    match print_result::<()>(global, "commit", "Committed", false, None) {
        Ok(()) => ExitCode::Clean,
        Err(e) => output_error(global, &e),
    }
}

fn run_revert(global: &GlobalOpts) -> ExitCode {
    let (outcome, restart_required) = match with_updater(global, |updater, latch| {
        let outcome = updater.revert()?;
        Ok((outcome, latch.is_requested()))
    }) {
        Ok(result) => result,
        Err(e) => return output_error(global, &e),
    };

    let result = match &outcome {
        RevertOutcome::RolledBack { .. } => "Reverted",
        RevertOutcome::Discarded { .. } => "Discarded",
    };
    if let Err(e) = print_result(global, "revert", result, restart_required, Some(&outcome)) {
        return output_error(global, &e);
    }
    if restart_required {
        ExitCode::RestartRequired
    } else {
        ExitCode::Clean
    }
}

// ============================================================================
// Config
// ============================================================================

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    match &args.command {
        ConfigCommands::Show => run_config_show(global),
        ConfigCommands::Schema => {
            let schema = schemars::schema_for!(OtaConfig);
            match print_json(&schema) {
                Ok(()) => ExitCode::Clean,
                Err(e) => output_error(global, &e),
            }
        }
        ConfigCommands::Validate { path } => run_config_validate(global, path.as_ref()),
    }
}

/// Display the resolved configuration (including defaults if no file present).
fn run_config_show(global: &GlobalOpts) -> ExitCode {
    let resolved = match load(global) {
        Ok(resolved) => resolved,
        Err(e) => return output_error(global, &e),
    };
    let snapshot = resolved.snapshot();

    let result = match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "source": {
                "kind": &snapshot.source,
                "path": snapshot.path.as_ref().map(|p| p.display().to_string()),
                "hash": &snapshot.hash,
                "using_defaults": snapshot.path.is_none(),
                "schema_version": &snapshot.schema_version,
            },
            "values": &snapshot.config,
        })),
        OutputFormat::Summary => {
            let src = snapshot
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            println!(
                "config: {} ({}) slot_dir={}",
                src,
                snapshot.source,
                snapshot.config.slot_dir.display()
            );
            Ok(())
        }
        OutputFormat::Exitcode => Ok(()),
        OutputFormat::Md => {
            println!("# ota-core config show");
            println!();
            if let Some(ref path) = snapshot.path {
                println!("Source: {} ({})", path.display(), snapshot.source);
                println!("Hash: {}", snapshot.hash.as_deref().unwrap_or("n/a"));
            } else {
                println!("Source: **built-in defaults** (no ota.json found)");
            }
            println!("Schema version: {}", snapshot.schema_version);
            println!("Slot directory: {}", snapshot.config.slot_dir.display());
            println!("Active image: {}", snapshot.config.active_image);
            println!("Watchdog: {}s", snapshot.config.watchdog_delay_secs);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::Clean,
        Err(e) => output_error(global, &e),
    }
}

/// Validate a configuration file.
fn run_config_validate(global: &GlobalOpts, path: Option<&PathBuf>) -> ExitCode {
    let options = ConfigOptions {
        config_path: path.cloned().or_else(|| global.config.clone()),
        slot_dir: global.slot_dir.clone(),
    };
    let resolved = match load_config(&options) {
        Ok(resolved) => resolved,
        Err(e) => return output_error(global, &e.into()),
    };

    let path_text = resolved
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in defaults".to_string());
    let result = match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "valid": true,
            "path": path_text,
            "hash": resolved.hash,
        })),
        OutputFormat::Exitcode => Ok(()),
        OutputFormat::Summary | OutputFormat::Md => {
            println!("valid: {}", path_text);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::Clean,
        Err(e) => output_error(global, &e),
    }
}

fn print_version(global: &GlobalOpts) -> ExitCode {
    let version_info = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "ota_core_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
    });

    match global.format {
        OutputFormat::Json => {
            if let Err(e) = print_json(&version_info) {
                return output_error(global, &e);
            }
        }
        OutputFormat::Exitcode => {}
        _ => {
            println!("ota-core {}", env!("CARGO_PKG_VERSION"));
            println!("schema version: {}", SCHEMA_VERSION);
        }
    }
    ExitCode::Clean
}

// ============================================================================
// Helpers
// ============================================================================

fn load(global: &GlobalOpts) -> Result<ResolvedConfig, Error> {
    let options = ConfigOptions {
        config_path: global.config.clone(),
        slot_dir: global.slot_dir.clone(),
    };
    Ok(load_config(&options)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report `err` in the requested format and pick the exit code.
fn output_error(global: &GlobalOpts, err: &Error) -> ExitCode {
    match global.format {
        OutputFormat::Json => println!("{}", StructuredError::from(err).to_json()),
        OutputFormat::Exitcode => {}
        OutputFormat::Summary | OutputFormat::Md => {
            eprintln!("{}", format_error_human(err, std::io::stderr().is_terminal()));
        }
    }
    ExitCode::from(err)
}

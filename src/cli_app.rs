//! Top-level CLI definition and dispatch.

use std::collections::BTreeMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use crossbeam_channel::Sender;
use serde_json::{Value, json};
use thiserror::Error;

use case_explorer::app::input::{Parsed, commands, parse_line};
use case_explorer::app::model::{AppState, ExplorerMsg, NoticeLevel, PageMove};
use case_explorer::app::render::{render_frame, render_grid};
use case_explorer::app::runtime::{ExplorerRuntime, FrameSink, RuntimeOptions, StopReason};
use case_explorer::app::update::update;
use case_explorer::core::config::Config;
use case_explorer::core::errors::CexError;
use case_explorer::core::logging;
use case_explorer::grid::entity::{EntityKind, SortDirection};
use case_explorer::grid::identity::RowId;
use case_explorer::grid::query::QueryTransport;
use case_explorer::grid::transport::{HttpTransport, ScriptedTransport};

/// Case explorer: refreshable, state-preserving case-record grids.
#[derive(Debug, Parser)]
#[command(
    name = "cexp",
    author,
    version,
    about = "Case explorer - browse and refresh case-record grids",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Serve requests from a JSON fixture instead of the remote server.
    #[arg(long, global = true, value_name = "FIXTURE")]
    replay: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Interactive explorer with periodic refresh.
    Watch(WatchArgs),
    /// Load one page of a grid and print it.
    Fetch(FetchArgs),
    /// Print the lookup label tables.
    Lookups,
    /// Print per-entity record counts.
    Counts,
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct WatchArgs {
    /// Tab shown first (the others load on first visit).
    #[arg(long, value_name = "ENTITY")]
    tab: Option<String>,
    /// Seconds between refresh cycles (0 disables the timer).
    #[arg(long, value_name = "SECONDS")]
    interval_secs: Option<u64>,
    /// Exit after this many completed refresh cycles.
    #[arg(long, value_name = "N")]
    max_cycles: Option<u64>,
    /// Fetch worker threads.
    #[arg(long, default_value_t = 4, value_name = "N")]
    workers: usize,
    /// Do not read commands from stdin.
    #[arg(long)]
    no_input: bool,
}

#[derive(Debug, Clone, Args)]
struct FetchArgs {
    /// Grid to load (assets, iocs, events, tasks, notes, evidences, feed).
    entity: String,
    /// Page number, 1-based.
    #[arg(long, default_value_t = 1, value_name = "N")]
    page: usize,
    /// Rows per page.
    #[arg(long, value_name = "N")]
    page_size: Option<usize>,
    /// Sort column index.
    #[arg(long, value_name = "COL")]
    sort: Option<usize>,
    /// Sort descending (with --sort).
    #[arg(long, requires = "sort")]
    desc: bool,
    /// Column filter, repeatable.
    #[arg(long, value_name = "COL=TEXT")]
    filter: Vec<String>,
    /// Global search text.
    #[arg(long, value_name = "TEXT")]
    search: Option<String>,
    /// Extra request parameter, repeatable.
    #[arg(long, value_name = "KEY=VALUE")]
    extra: Vec<String>,
    /// Show details for a row, repeatable.
    #[arg(long, value_name = "ID")]
    expand: Vec<String>,
    /// Give up after this many seconds.
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration (API key redacted).
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Server, network, or runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<CexError> for CliError {
    fn from(err: CexError) -> Self {
        match err {
            CexError::InvalidConfig { .. }
            | CexError::MissingConfig { .. }
            | CexError::ConfigParse { .. }
            | CexError::InvalidQuery { .. }
            | CexError::UnknownEntity { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Watch(args) => run_watch(cli, args),
        Command::Fetch(args) => run_fetch(cli, args),
        Command::Lookups => run_lookups(cli),
        Command::Counts => run_counts(cli),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose);
    Ok(config)
}

fn build_transport(cli: &Cli, config: &Config) -> Result<Arc<dyn QueryTransport>, CliError> {
    if let Some(path) = &cli.replay {
        tracing::info!(fixture = %path.display(), "serving from replay fixture");
        return Ok(Arc::new(ScriptedTransport::from_fixture_file(path)?));
    }
    Ok(Arc::new(HttpTransport::new(config)?))
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

fn run_watch(cli: &Cli, args: &WatchArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if let Some(tab) = &args.tab {
        config.grids.initial_tab = EntityKind::parse(tab)?.key().to_string();
    }
    if let Some(secs) = args.interval_secs {
        config.refresh.interval_secs = secs;
    }
    let transport = build_transport(cli, &config)?;
    let mut runtime = ExplorerRuntime::start(
        transport,
        RuntimeOptions {
            workers: args.workers,
            max_cycles: args.max_cycles,
        },
    )?;
    runtime.shutdown_signal().register_os_signals();
    if !args.no_input {
        spawn_input_reader(runtime.sender())?;
    }

    let (mut state, cmd) = AppState::init(&config, Instant::now())?;
    let mut sink = WatchSink::new(output_mode(cli));
    let reason = runtime.run(&mut state, cmd, &mut sink)?;
    state.teardown();
    runtime.shutdown();

    if output_mode(cli) == OutputMode::Json {
        write_json_line(&json!({
            "event": "stopped",
            "reason": format!("{reason:?}").to_ascii_lowercase(),
            "cycles": sink.cycles,
        }))?;
    } else if reason == StopReason::Signal {
        eprintln!("{}", "interrupted".dimmed());
    }
    Ok(())
}

fn spawn_input_reader(events: Sender<ExplorerMsg>) -> Result<(), CliError> {
    thread::Builder::new()
        .name("cexp-input".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_line(&line) {
                    Ok(Parsed::Msg(msg)) => {
                        if events.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Parsed::Help) => {
                        for c in commands() {
                            eprintln!("  {:<24} {}", c.usage, c.summary);
                        }
                    }
                    Ok(Parsed::Empty) => {}
                    Err(err) => eprintln!("{}", err.to_string().yellow()),
                }
            }
        })
        .map(|_| ())
        .map_err(|e| CliError::Runtime(format!("failed to spawn input thread: {e}")))
}

/// Prints a frame whenever the rendered text changes.
struct WatchSink {
    mode: OutputMode,
    last: String,
    cycles: u64,
}

impl WatchSink {
    fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            last: String::new(),
            cycles: 0,
        }
    }
}

impl FrameSink for WatchSink {
    fn frame(&mut self, state: &AppState) {
        self.cycles = state.coordinator.cycles_completed();
        match self.mode {
            OutputMode::Human => {
                let frame = render_frame(state);
                if frame != self.last {
                    println!("{}", colorize_frame(&frame));
                    self.last = frame;
                }
            }
            OutputMode::Json => {
                let summaries: Vec<Value> = state
                    .grids
                    .iter()
                    .filter(|(_, g)| g.phase().is_mounted() || g.last_error().is_some())
                    .filter_map(|(_, g)| serde_json::to_value(g.summary()).ok())
                    .collect();
                let payload = json!({
                    "event": "frame",
                    "active": state.active_tab,
                    "cycles": self.cycles,
                    "grids": summaries,
                    "counts": counts_json(&state.counts),
                });
                let text = payload.to_string();
                if text != self.last {
                    let _ = write_json_line(&payload);
                    self.last = text;
                }
            }
        }
    }

    fn emit(&mut self, text: &str) {
        match self.mode {
            OutputMode::Human => println!("{text}"),
            OutputMode::Json => {
                let record: Value = serde_json::from_str(text).unwrap_or(Value::Null);
                let _ = write_json_line(&json!({"event": "copy", "record": record}));
            }
        }
    }
}

fn colorize_frame(frame: &str) -> String {
    frame
        .lines()
        .map(|line| {
            if line.starts_with("[error]") {
                line.red().to_string()
            } else if line.starts_with("[warn]") {
                line.yellow().to_string()
            } else if line.starts_with("-- ") {
                line.dimmed().to_string()
            } else if line.starts_with('[') || line.contains(" | [") {
                line.bold().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

fn run_fetch(cli: &Cli, args: &FetchArgs) -> Result<(), CliError> {
    let kind = EntityKind::parse(&args.entity)?;
    let mut config = load_config(cli)?;
    config.grids.initial_tab = kind.key().to_string();
    if !config.grids.enabled_kinds().contains(&kind) {
        config.grids.enabled.push(kind.key().to_string());
    }
    if let Some(size) = args.page_size {
        config.grids.page_size = size;
    }
    config.refresh.interval_secs = 0;
    if args.page == 0 {
        return Err(CliError::User("--page is 1-based".to_string()));
    }

    let mut messages = Vec::new();
    for raw in &args.filter {
        let (column, text) = split_pair(raw, "--filter")?;
        let column = column
            .parse()
            .map_err(|_| CliError::User(format!("--filter column must be a number, got {column:?}")))?;
        messages.push(ExplorerMsg::Filter {
            column,
            text: text.to_string(),
        });
    }
    if let Some(search) = &args.search {
        messages.push(ExplorerMsg::Search(search.clone()));
    }
    for raw in &args.extra {
        let (key, value) = split_pair(raw, "--extra")?;
        messages.push(ExplorerMsg::Extra {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    if let Some(column) = args.sort {
        let direction = if args.desc { SortDirection::Desc } else { SortDirection::Asc };
        messages.push(ExplorerMsg::Sort {
            column,
            direction: Some(direction),
        });
    }
    if args.page > 1 {
        messages.push(ExplorerMsg::Page(PageMove::Goto(args.page - 1)));
    }

    let transport = build_transport(cli, &config)?;
    let mut runtime = ExplorerRuntime::start(transport, RuntimeOptions::default())?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let (mut state, cmd) = AppState::init(&config, Instant::now())?;
    runtime.run_until_idle(&mut state, cmd, timeout)?;

    for msg in messages {
        let cmd = update(&mut state, msg, Instant::now());
        runtime.run_until_idle(&mut state, cmd, timeout)?;
        if let Some(notice) = state.notices.iter().find(|n| n.level == NoticeLevel::Error) {
            return Err(CliError::User(notice.message.clone()));
        }
    }
    for id in &args.expand {
        update(&mut state, ExplorerMsg::Expand(RowId::from(id.as_str())), Instant::now());
    }

    let grid = state.active_grid()?;
    if !grid.phase().is_mounted() {
        let reason = grid.last_error().unwrap_or("grid did not load").to_string();
        return Err(CliError::Runtime(reason));
    }
    match output_mode(cli) {
        OutputMode::Human => {
            print!("{}", render_grid(grid));
            if let Some(error) = grid.last_error() {
                eprintln!("{}", format!("warning: {error}").yellow());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "fetch",
                "summary": grid.summary(),
                "columns": kind.spec().columns.iter().map(|c| c.title).collect::<Vec<_>>(),
                "rows": grid.rows(),
                "meta": grid.meta(),
            }))?;
        }
    }
    state.teardown();
    runtime.shutdown();
    Ok(())
}

fn split_pair<'a>(raw: &'a str, flag: &str) -> Result<(&'a str, &'a str), CliError> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| CliError::User(format!("{flag} expects KEY=VALUE, got {raw:?}")))
}

// ---------------------------------------------------------------------------
// lookups / counts
// ---------------------------------------------------------------------------

fn run_lookups(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let table = build_transport(cli, &config)?.lookups()?;
    match output_mode(cli) {
        OutputMode::Human => {
            for (category, labels) in table.iter() {
                println!("{}", category.bold());
                for (id, label) in labels {
                    println!("  {id:>6}  {label}");
                }
            }
        }
        OutputMode::Json => {
            let categories: BTreeMap<&str, _> = table.iter().collect();
            write_json_line(&json!({"command": "lookups", "lookups": categories}))?;
        }
    }
    Ok(())
}

fn run_counts(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let counts = build_transport(cli, &config)?.counts()?;
    match output_mode(cli) {
        OutputMode::Human => {
            for (kind, count) in &counts {
                println!("{:<18} {count}", kind.label());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({"command": "counts", "counts": counts_json(&counts)}))?;
        }
    }
    Ok(())
}

fn counts_json(counts: &BTreeMap<EntityKind, u64>) -> Value {
    counts
        .iter()
        .map(|(kind, count)| (kind.key().to_string(), json!(count)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let mut config = Config::load(cli.config.as_deref())?;
            if !config.server.api_key.is_empty() {
                config.server.api_key = format!("<redacted:{}>", logging::fingerprint(&config.server.api_key));
            }
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("{}", "Configuration is valid.".green());
                        println!("  Source: {}", config.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("{} {e}", "Configuration is INVALID:".red()),
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CEX_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };
    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

use std::future::Future;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use veilagent::agent::sessions::truncate;
use veilagent::agent::{AgentEvent, AgentLoop, Role, Session, SessionStore, TurnOutcome};
use veilagent::config::Config;
use veilagent::error::AgentError;
use veilagent::metrics::gather_text;
use veilagent::ollama::ChatClient;
use veilagent::proxy::{candidate_paths, is_executable_file, locate, Platform, ProxyControl, ProxySupervisor};
use veilagent::tools::{HttpWebTools, Sandbox, ToolExecutor};
use veilagent::tracing::{init_tracing, shutdown_tracing, TracingOptions};

#[derive(Debug, Parser)]
#[command(name = "veilagent", version)]
#[command(about = "Local research agent with web, Tor, file and sandboxed Python tools", long_about = None)]
struct Cli {
    /// Model tag served by Ollama
    #[arg(long)]
    model: Option<String>,
    /// Ollama base URL
    #[arg(long)]
    ollama_url: Option<String>,
    /// Never request extended reasoning
    #[arg(long)]
    no_think: bool,
    /// Do not launch the embedded Tor daemon
    #[arg(long)]
    no_tor: bool,
    /// Path to the tor executable (skips discovery)
    #[arg(long)]
    tor_bin: Option<PathBuf>,
    /// Session store root
    #[arg(long)]
    store: Option<PathBuf>,
    /// Directory the file tools may read
    #[arg(long)]
    home_dir: Option<PathBuf>,
    #[arg(long)]
    max_tool_rounds: Option<usize>,
    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
    /// Log filter directive (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive session (default)
    Chat {
        /// Resume an existing session
        #[arg(long)]
        session: Option<String>,
    },
    /// Ask a single question and print the answer
    Ask {
        #[arg(required = true)]
        question: Vec<String>,
        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,
    },
    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Inspect or test the Tor daemon
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
    /// Print Prometheus metrics
    Metrics,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    List,
    Show { id: String },
    Rename {
        id: String,
        #[arg(required = true)]
        title: Vec<String>,
    },
    Delete { id: String },
    Export {
        id: String,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ProxyCommand {
    /// Show discovery result and configuration
    Status,
    /// Launch, wait for bootstrap, report and stop
    Check,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.trim_end_matches('/').to_string();
        }
        if self.no_think {
            config.think = false;
        }
        if self.no_tor {
            config.proxy_enabled = false;
        }
        if let Some(bin) = &self.tor_bin {
            config.proxy_binary = Some(bin.clone());
        }
        if let Some(store) = &self.store {
            config.store_root = store.clone();
        }
        if let Some(home) = &self.home_dir {
            config.home_dir = home.clone();
        }
        if let Some(rounds) = self.max_tool_rounds {
            config.max_tool_rounds = rounds;
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

/// Everything a command needs, wired once
struct App {
    config: Config,
    agent: AgentLoop,
    proxy: Arc<ProxySupervisor>,
    store: Arc<SessionStore>,
    events: Mutex<UnboundedReceiver<AgentEvent>>,
}

impl App {
    fn build(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(
            SessionStore::open(&config.store_root)
                .with_context(|| format!("opening session store at {}", config.store_root.display()))?,
        );
        let proxy = Arc::new(ProxySupervisor::new(config.proxy()));
        let web = Arc::new(HttpWebTools::new(&config.tools()).context("building HTTP clients")?);
        let executor = Arc::new(ToolExecutor::new(config.tools(), web, Sandbox::new(config.sandbox())));
        let model = Arc::new(ChatClient::new(config.ollama_url.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let agent =
            AgentLoop::new(config.agent(), model, executor, proxy.clone(), store.clone()).with_events(events_tx);

        Ok(Self {
            config,
            agent,
            proxy,
            store,
            events: Mutex::new(events_rx),
        })
    }

    fn new_session(&self, title: Option<&str>) -> anyhow::Result<Session> {
        let id = self.store.create(title, &self.config.model)?;
        Ok(self.store.load(&id)?)
    }

    /// Run one turn, printing tool progress; Ctrl+C cancels it
    async fn turn(&self, session: &mut Session, text: &str) -> Result<TurnOutcome, AgentError> {
        let cancel = CancellationToken::new();
        let mut events = self.events.lock().await;
        let turn = self.agent.run_turn(session, text, &cancel);
        tokio::pin!(turn);
        loop {
            tokio::select! {
                result = &mut turn => {
                    while let Ok(event) = events.try_recv() {
                        print_event(&event);
                    }
                    break result;
                }
                Some(event) = events.recv() => print_event(&event),
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    eprintln!("\n[cancelling turn]");
                    cancel.cancel();
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);

    let options = TracingOptions {
        otlp_endpoint: config.otlp_endpoint.clone(),
        json: config.log_json,
        filter: cli.log_filter.clone(),
    };
    if let Err(e) = init_tracing("veilagent", &options) {
        eprintln!("[WARN] tracing disabled: {}", e);
    }

    let result = run(cli.command, config).await;
    shutdown_tracing();
    result
}

async fn run(command: Option<Commands>, config: Config) -> anyhow::Result<()> {
    match command {
        None => repl(App::build(config)?, None).await,
        Some(Commands::Chat { session }) => repl(App::build(config)?, session).await,
        Some(Commands::Ask { question, session }) => ask(App::build(config)?, &question.join(" "), session).await,
        Some(Commands::Sessions { command }) => sessions(&config, command),
        Some(Commands::Proxy { command }) => proxy(config, command).await,
        Some(Commands::Metrics) => {
            print!("{}", gather_text());
            Ok(())
        }
    }
}

async fn ask(app: App, question: &str, session_id: Option<String>) -> anyhow::Result<()> {
    let mut session = match session_id {
        Some(id) => app.store.load(&id)?,
        None => app.new_session(Some(&truncate(question, 60)))?,
    };

    let result = app.turn(&mut session, question).await;
    app.proxy.shutdown().await;

    let outcome = result?;
    warn_if_synthesized(&outcome);
    println!("{}", outcome.reply);
    eprintln!("[session {}]", session.id);
    Ok(())
}

async fn repl(app: App, session_id: Option<String>) -> anyhow::Result<()> {
    let mut session: Option<Session> = match session_id {
        Some(id) => Some(app.store.load(&id)?),
        None => None,
    };

    if app.config.proxy_enabled {
        let proxy = app.proxy.clone();
        let timeout = app.config.proxy_ready_timeout;
        tokio::spawn(async move {
            let state = proxy.ensure_ready(timeout).await;
            info!(status = %state.status, "background proxy startup finished");
        });
    }

    println!(
        "veilagent {} | model {} | /help for commands",
        env!("CARGO_PKG_VERSION"),
        app.config.model
    );
    if let Some(s) = &session {
        println!("Resumed \"{}\" ({} turns)", s.title, s.turns.len());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush().ok();

        let line = match next_input(&mut lines, tokio::signal::ctrl_c()).await? {
            PromptInput::Line(line) => line,
            PromptInput::Eof => break,
            PromptInput::Interrupted => {
                println!();
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match slash_command(&app, &mut session, command).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    continue;
                }
            }
        }

        if session.is_none() {
            match app.new_session(Some(&truncate(line, 60))) {
                Ok(created) => session = Some(created),
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    continue;
                }
            }
        }
        let Some(current) = session.as_mut() else {
            continue;
        };
        match app.turn(current, line).await {
            Ok(outcome) => {
                warn_if_synthesized(&outcome);
                println!("assistant> {}\n", outcome.reply);
            }
            Err(e) => eprintln!("error [{}]: {}", e.kind(), e),
        }
    }

    app.proxy.shutdown().await;
    Ok(())
}

#[derive(Debug, PartialEq)]
enum PromptInput {
    Line(String),
    Eof,
    Interrupted,
}

/// Next line from the prompt, unless `interrupt` (Ctrl+C) fires first
async fn next_input<R, F>(lines: &mut Lines<R>, interrupt: F) -> std::io::Result<PromptInput>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        next = lines.next_line() => Ok(match next? {
            Some(line) => PromptInput::Line(line),
            None => PromptInput::Eof,
        }),
        _ = interrupt => Ok(PromptInput::Interrupted),
    }
}

/// Returns false when the REPL should exit
async fn slash_command(app: &App, session: &mut Option<Session>, command: &str) -> anyhow::Result<bool> {
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    match name {
        "quit" | "exit" => return Ok(false),
        "help" => print_help(),
        "new" => {
            let title = (!rest.is_empty()).then_some(rest);
            let created = app.new_session(title)?;
            println!("New session \"{}\" ({})", created.title, created.id);
            *session = Some(created);
        }
        "list" => print_sessions(&app.store)?,
        "load" => {
            if rest.is_empty() {
                bail!("usage: /load <id>");
            }
            let loaded = app.store.load(rest)?;
            println!("Loaded \"{}\" ({} turns)", loaded.title, loaded.turns.len());
            *session = Some(loaded);
        }
        "delete" => {
            if rest.is_empty() {
                bail!("usage: /delete <id>");
            }
            app.store.delete(rest)?;
            if session.as_ref().map(|s| s.id == rest).unwrap_or(false) {
                *session = None;
            }
            println!("Deleted {}", rest);
        }
        "rename" => {
            let Some(current) = session.as_mut() else {
                bail!("no active session");
            };
            if rest.is_empty() {
                bail!("usage: /rename <title>");
            }
            let meta = app.store.rename(&current.id, rest)?;
            current.title = meta.title;
            current.updated_at = meta.updated_at;
            println!("Renamed to \"{}\"", current.title);
        }
        "export" => {
            let Some(current) = session.as_ref() else {
                bail!("no active session");
            };
            let markdown = app.store.export_markdown(&current.id)?;
            if rest.is_empty() {
                println!("{}", markdown);
            } else {
                std::fs::write(rest, markdown).with_context(|| format!("writing {}", rest))?;
                println!("Exported to {}", rest);
            }
        }
        "tor" => {
            let state = match rest {
                "on" => app.proxy.start(app.config.proxy_ready_timeout).await,
                "off" => app.proxy.shutdown().await,
                "check" => app.proxy.health_check().await,
                "" | "status" => app.proxy.status(),
                other => bail!("usage: /tor on|off|status|check (got {:?})", other),
            };
            println!("{}", state.describe());
        }
        "home-dir" => {
            if rest.is_empty() {
                println!("{}", app.agent.tools().home_dir().display());
            } else {
                let path = PathBuf::from(rest);
                if !path.is_dir() {
                    bail!("not a directory: {}", path.display());
                }
                let path = path.canonicalize()?;
                app.agent.tools().set_home_dir(&path);
                println!("File tools now read from {}", path.display());
            }
        }
        "metrics" => print!("{}", gather_text()),
        other => bail!("unknown command /{} (try /help)", other),
    }
    Ok(true)
}

fn print_help() {
    println!(
        "Commands:\n  \
         /new [title]        start a new session\n  \
         /list               list sessions\n  \
         /load <id>          resume a session\n  \
         /delete <id>        delete a session\n  \
         /rename <title>     rename the current session\n  \
         /export [file]      export the current session as markdown\n  \
         /tor on|off|status|check\n  \
         /home-dir [path]    show or change the file tools directory\n  \
         /metrics            print metrics\n  \
         /quit"
    );
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Thinking(text) => eprintln!("  (thinking) {}", truncate(&text.replace('\n', " "), 120)),
        AgentEvent::ToolStart(call) => {
            eprintln!("  [{}] {}", call.tool_name, truncate(&call.arguments.to_string(), 80))
        }
        AgentEvent::ToolEnd(result) if result.is_error() => {
            let kind = result.error.map(|k| k.to_string()).unwrap_or_default();
            eprintln!("  [{}] error: {}", result.tool_name, kind)
        }
        AgentEvent::ToolEnd(result) => {
            eprintln!("  [{}] ok ({} chars)", result.tool_name, result.output.chars().count())
        }
    }
}

fn warn_if_synthesized(outcome: &TurnOutcome) {
    if outcome.synthesized {
        warn!(rounds = outcome.rounds, "reply was synthesized");
    }
}

fn print_sessions(store: &SessionStore) -> anyhow::Result<()> {
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for meta in sessions {
        println!(
            "{}  {}  {:>4} turns  {}",
            meta.id,
            meta.updated_at.format("%Y-%m-%d %H:%M"),
            meta.turn_count,
            truncate(&meta.title, 50)
        );
    }
    Ok(())
}

fn sessions(config: &Config, command: SessionCommand) -> anyhow::Result<()> {
    let store = SessionStore::open(&config.store_root)?;
    match command {
        SessionCommand::List => print_sessions(&store)?,
        SessionCommand::Show { id } => {
            let session = store.load(&id)?;
            println!("{} ({}) model {}", session.title, session.id, session.model);
            for turn in &session.turns {
                let label = match (&turn.role, &turn.tool_name) {
                    (Role::Tool, Some(name)) => format!("tool:{}", name),
                    (role, _) => role.as_str().to_string(),
                };
                let mut text = truncate(&turn.content.replace('\n', " "), 100);
                if !turn.tool_calls.is_empty() {
                    let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.tool_name.as_str()).collect();
                    text = format!("calls {}", names.join(", "));
                }
                println!("  {:<18} {}", label, text);
            }
        }
        SessionCommand::Rename { id, title } => {
            let meta = store.rename(&id, &title.join(" "))?;
            println!("Renamed {} to \"{}\"", meta.id, meta.title);
        }
        SessionCommand::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted {}", id);
        }
        SessionCommand::Export { id, output } => {
            let markdown = store.export_markdown(&id)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, markdown).with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", markdown),
            }
        }
    }
    Ok(())
}

async fn proxy(config: Config, command: ProxyCommand) -> anyhow::Result<()> {
    match command {
        ProxyCommand::Status => {
            let candidates = candidate_paths(
                Platform::current(),
                |key| std::env::var(key).ok(),
                config.proxy_binary.as_deref(),
            );
            println!("enabled: {}", config.proxy_enabled);
            match locate(&candidates, is_executable_file) {
                Some(binary) => println!("binary: {}", binary.display()),
                None => println!("binary: not found ({} locations checked)", candidates.len()),
            }
        }
        ProxyCommand::Check => {
            let supervisor = ProxySupervisor::new(config.proxy());
            let state = supervisor.ensure_ready(config.proxy_ready_timeout).await;
            println!("{}", state.describe());
            supervisor.shutdown().await;
            if !state.is_running() {
                bail!("proxy did not become ready");
            }
        }
    }
    Ok(())
}

//! tilemux - a tiling terminal multiplexer
//!
//! # Quick Start
//!
//! ```text
//! tilemux                # Run a session in this terminal
//! tilemux server         # Run a shared session in the background
//! tilemux attach         # Attach this terminal to the server
//! tilemux list           # List windows of the running server
//! ```
//!
//! # Keybindings (Ctrl+A prefix)
//!
//! | Key | Action |
//! |-----|--------|
//! | c | New window |
//! | n | Next window |
//! | " | Split stacked |
//! | % | Split side by side |
//! | x | Kill pane |
//! | h/j/k/l | Grow the pane left/down/up/right |
//! | H/J/K/L | Focus the pane left/down/up/right |
//! | o | Next pane |
//! | R | Redraw |
//! | d | Detach (attached clients) |
//! | Ctrl+A | Literal Ctrl+A |

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tilemux::config::{self, Config, DEFAULT_TCP_ADDR};
use tilemux::server::client::{self, AttachOutcome};
use tilemux::server::daemon::Server;
use tilemux::server::protocol::Command as Call;
use tilemux::server::Endpoint;
use tilemux::ui::input::{InputDispatcher, Variant};
use tilemux::ui::renderer::StdoutBackend;
use tilemux::ui::terminal::{self, RawTerminal, StdinReader};
use tilemux::wm::{Session, SessionHandle};

/// Blocking pool cap; each pane's reaper holds one thread
const MAX_BLOCKING_THREADS: usize = 1024;

/// A tiling terminal multiplexer
#[derive(Parser, Debug)]
#[command(name = "tilemux", version, about)]
struct Cli {
    /// Config file (default ~/.tilemux/config.toml)
    #[arg(long, env = "TILEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Command run in new panes
    #[arg(short = 's', long)]
    shell: Option<String>,

    /// Unix socket of the server
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Use loopback TCP instead of the Unix socket
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_TCP_ADDR)]
    tcp: Option<String>,

    /// Log filter (debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Run a session in this terminal (default)
    Standalone,
    /// Run a session served over the control socket
    Server,
    /// Attach this terminal to a running server
    Attach,
    /// Print the server's windows and panes as JSON
    Info,
    /// List the server's windows
    List,
    /// Open a window in the server's session
    NewWindow,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if cli.shell.is_some() {
        config.shell = cli.shell.clone();
    }
    if cli.socket.is_some() {
        config.server.socket = cli.socket.clone();
    }
    if cli.tcp.is_some() {
        config.server.tcp = cli.tcp.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    init_logging(&config);
    let mode = cli.mode.unwrap_or(Mode::Standalone);
    info!("tilemux {} starting ({:?})", env!("CARGO_PKG_VERSION"), mode);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .build()
        .context("failed to start the runtime")?;
    let local = LocalSet::new();
    let result = local.block_on(&runtime, run(mode, config));

    // Reapers of panes still alive would keep a blocking shutdown waiting.
    runtime.shutdown_background();
    if let Err(e) = &result {
        error!("Exiting with error: {:#}", e);
    }
    result
}

async fn run(mode: Mode, config: Config) -> anyhow::Result<()> {
    let endpoint = Endpoint::from_config(&config);
    match mode {
        Mode::Standalone => run_standalone(&config).await,
        Mode::Server => run_server(&config, endpoint).await,
        Mode::Attach => {
            install_panic_hook();
            if client::attach(&endpoint).await? == AttachOutcome::Detached {
                println!("[detached]");
            } else {
                println!("[server exited]");
            }
            Ok(())
        }
        Mode::Info => print_reply(&endpoint, Call::GetSessionInfo).await,
        Mode::List => print_reply(&endpoint, Call::GetSessions).await,
        Mode::NewWindow => print_reply(&endpoint, Call::NewWindow).await,
    }
}

/// Log to ~/.tilemux/tilemux.log; the terminal itself is the UI.
fn init_logging(config: &Config) {
    let log_path = config::log_path();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Leave raw mode before the panic message is printed.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = terminal::restore();
        default_hook(panic_info);
    }));
}

async fn run_standalone(config: &Config) -> anyhow::Result<()> {
    let (session, driver) = Session::new(config);

    install_panic_hook();
    let mut raw = RawTerminal::enter().context("failed to set up the terminal")?;

    session.borrow_mut().add_renderer(Rc::new(StdoutBackend::new()));
    session
        .borrow_mut()
        .create_new_window()
        .context("failed to create the first window")?;

    let input = tokio::task::spawn_local(forward_keys(session.clone()));
    let resize = tokio::task::spawn_local(watch_resize(session.clone()));

    driver.run().await;

    input.abort();
    resize.abort();
    raw.leave()?;
    Ok(())
}

/// Keyboard to the local session through the prefix dispatcher
async fn forward_keys(session: SessionHandle) {
    let stdin = match StdinReader::new() {
        Ok(stdin) => stdin,
        Err(e) => {
            error!("Cannot read stdin: {}", e);
            return;
        }
    };
    let mut dispatcher = InputDispatcher::new(Variant::Standalone);
    let mut buf = vec![0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => dispatcher.process(&buf[..n], &mut *session.borrow_mut()),
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
}

async fn watch_resize(session: SessionHandle) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!("Cannot watch SIGWINCH: {}", e);
            return;
        }
    };
    while winch.recv().await.is_some() {
        let (width, height) = terminal::size();
        info!("Terminal resized to {}x{}", width, height);
        session.borrow_mut().update_size();
    }
}

async fn run_server(config: &Config, endpoint: Endpoint) -> anyhow::Result<()> {
    let (session, driver) = Session::new(config);
    session
        .borrow_mut()
        .create_new_window()
        .context("failed to create the first window")?;

    eprintln!("tilemux server listening on {}", endpoint);
    Server::new(session, endpoint).run(driver).await
}

async fn print_reply(endpoint: &Endpoint, call: Call) -> anyhow::Result<()> {
    if let Some(text) = client::run_command(endpoint, call).await? {
        println!("{}", text.trim_end());
    }
    Ok(())
}

mod app;
mod block;
mod channel;
mod cli;
mod config;
mod history;
mod input;
mod model;
mod repl;
mod terminal;
mod ui;
mod viewport;

use anyhow::{Context, Result};
use app::{App, AppCommand, AppOptions};
use channel::EventChannel;
use clap::Parser;
use cli::CliArgs;
use config::{RuntimeConfigSnapshot, RuntimeConfigWatcher};
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use futures::StreamExt;
use model::{InlinePolicy, TabId};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use repl::ShellRepl;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FALLBACK_SHELL: &str = "/bin/sh";

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args)?;

    let mut watcher = match &args.config {
        Some(path) => RuntimeConfigWatcher::at(path.clone()),
        None => RuntimeConfigWatcher::discover(),
    };
    let (config, config_error) = match watcher.load_current() {
        Ok(config) => (config, None),
        Err(error) => {
            warn!("{error:#}");
            (RuntimeConfigSnapshot::default(), Some(compact_error(&error)))
        }
    };

    let channel = EventChannel::new();
    let (wake_tx, wake_rx) = mpsc::unbounded_channel::<TabId>();
    let mut repl = ShellRepl::new(channel.clone(), resolve_shell(&args, &config))
        .with_wake(wake_tx);
    repl.set_aliases(config.aliases.clone());

    let mut app = App::new(
        channel,
        AppOptions {
            prompt: config.prompt.clone(),
            popup: args.popup || config.popup,
            policy: InlinePolicy {
                inline_scalar_responses: config.inline_scalar_responses,
            },
            history_limit: config.history_limit,
        },
        usize::from(args.tabs),
    );
    match config_error {
        Some(error) => app.set_status(format!("Config error: {error}")),
        None => app.set_status(format!("Shell: {}", repl.shell())),
    }
    info!(shell = repl.shell(), source = ?config.source, "starting");

    let session = Session {
        args: &args,
        repl: &mut repl,
        watcher: &mut watcher,
        wake_rx,
    };
    run(&mut app, session).await
}

struct Session<'a> {
    args: &'a CliArgs,
    repl: &'a mut ShellRepl,
    watcher: &'a mut RuntimeConfigWatcher,
    wake_rx: mpsc::UnboundedReceiver<TabId>,
}

fn init_tracing(args: &CliArgs) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let _ = builder.with_ansi(false).with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::sink).try_init();
        }
    }

    Ok(())
}

fn resolve_shell(args: &CliArgs, config: &RuntimeConfigSnapshot) -> String {
    args.shell
        .clone()
        .or_else(|| config.shell.clone())
        .or_else(|| std::env::var("SHELL").ok().filter(|shell| !shell.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

async fn run(app: &mut App, session: Session<'_>) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, session).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

fn draw(terminal: &mut TuiTerminal, app: &mut App) -> Result<()> {
    app.pump();
    terminal
        .draw(|frame| ui::render(frame, app))
        .context("failed to render terminal frame")?;
    if app.apply_effects() {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;
    }
    Ok(())
}

async fn run_loop(terminal: &mut TuiTerminal, app: &mut App, session: Session<'_>) -> Result<()> {
    let Session {
        args,
        repl,
        watcher,
        mut wake_rx,
    } = session;
    let mut reader = EventStream::new();
    let mut ticker = interval(CONFIG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        draw(terminal, app)?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.focus(), key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            execute_app_command(app, repl, command);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            maybe_tab = wake_rx.recv() => {
                if let Some(tab) = maybe_tab {
                    debug!(%tab, "lifecycle event");
                }
            }
            _ = ticker.tick() => {
                reload_config(app, repl, watcher, args);
            }
        }
    }

    Ok(())
}

fn execute_app_command(app: &mut App, repl: &ShellRepl, command: AppCommand) {
    match command {
        AppCommand::None => {}
        AppCommand::Exec { tab, line } => {
            if let Some(exec_id) = repl.pexec(tab, &line) {
                debug!(%tab, %exec_id, "exec");
            }
        }
        AppCommand::Interrupt { tab } => {
            let exec_id = repl.interrupt(tab);
            debug!(%tab, %exec_id, "interrupt");
        }
        AppCommand::ClearTerminal { tab } => repl.clear(tab),
        AppCommand::RefreshSidecar { tab, command } => match repl.qexec(tab, &command) {
            Some(exec_id) => {
                debug!(%tab, %exec_id, "sidecar refresh");
                app.track_refresh(exec_id, tab, command);
            }
            None => app.set_status("Nothing to refresh"),
        },
        AppCommand::AbandonTab { tab } => {
            repl.abandon_tab(tab);
        }
    }
}

fn reload_config(
    app: &mut App,
    repl: &mut ShellRepl,
    watcher: &mut RuntimeConfigWatcher,
    args: &CliArgs,
) {
    match watcher.reload_if_changed() {
        Ok(Some(config)) => {
            app.apply_config(&config, args.popup);
            repl.set_aliases(config.aliases.clone());
            repl.set_shell(resolve_shell(args, &config));
            info!(source = ?config.source, shell = repl.shell(), "runtime config reloaded");
            app.set_status(match &config.source {
                Some(source) => format!("Reloaded {source}"),
                None => "Config removed, using defaults".to_string(),
            });
        }
        Ok(None) => {}
        Err(error) => {
            warn!("{error:#}");
            app.set_status(format!("Config error: {}", compact_error(&error)));
        }
    }
}

fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}

use crate::channel::{CommandComplete, CommandStart, EventChannel};
use crate::model::{EvaluatorOptions, ExecId, ExecOptions, Response, ResponseKind, TabId};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const CLEAR_BUILTIN: &str = "clear";

#[derive(Debug)]
struct RunningExec {
    tab: TabId,
    echo: bool,
    order: u64,
    abort: AbortHandle,
}

type RunningTable = Arc<Mutex<HashMap<ExecId, RunningExec>>>;

pub struct ShellRepl {
    channel: EventChannel,
    shell: String,
    aliases: HashMap<String, String>,
    running: RunningTable,
    next_order: AtomicU64,
    wake: Option<mpsc::UnboundedSender<TabId>>,
}

impl ShellRepl {
    pub fn new(channel: EventChannel, shell: impl Into<String>) -> Self {
        Self {
            channel,
            shell: shell.into(),
            aliases: HashMap::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_order: AtomicU64::new(0),
            wake: None,
        }
    }

    pub fn with_wake(mut self, wake: mpsc::UnboundedSender<TabId>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn set_shell(&mut self, shell: impl Into<String>) {
        self.shell = shell.into();
    }

    pub fn set_aliases(&mut self, aliases: HashMap<String, String>) {
        self.aliases = aliases;
    }

    /// The `clear` builtin publishes a clear event and returns `None`.
    pub fn exec(&self, tab: TabId, line: &str, options: ExecOptions) -> Option<ExecId> {
        let command = self.expand_aliases(line);
        if command.trim() == CLEAR_BUILTIN {
            self.clear(tab);
            return None;
        }

        let exec_id = ExecId::new();
        let echo = options.echo;
        self.channel.publish_start(
            tab,
            CommandStart {
                exec_id,
                command: command.clone(),
                echo,
            },
        );
        self.notify(tab);
        debug!(%tab, %exec_id, %command, echo, "exec");

        let channel = self.channel.clone();
        let running = Arc::clone(&self.running);
        let wake = self.wake.clone();
        let shell = self.shell.clone();
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);

        let (registered_tx, registered) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            // Completion is owned by whoever removes the table entry, so wait
            // until the entry exists.
            if registered.await.is_err() {
                return;
            }
            let response = match run_shell(&shell, &command).await {
                Ok(response) => response,
                Err(error) => Response::Error(format!("{error:#}")),
            };
            if lock(&running).remove(&exec_id).is_none() {
                debug!(%tab, %exec_id, "exec finished after interrupt");
                return;
            }

            let response_kind = ResponseKind::classify(&response);
            channel.publish_complete(
                tab,
                CommandComplete {
                    exec_id,
                    response,
                    response_kind,
                    cancelled: false,
                    echo,
                    evaluator_options: EvaluatorOptions::default(),
                    exec_options: options,
                },
            );
            if let Some(wake) = wake {
                let _ = wake.send(tab);
            }
        });
        lock(&self.running).insert(
            exec_id,
            RunningExec {
                tab,
                echo,
                order,
                abort: handle.abort_handle(),
            },
        );
        let _ = registered_tx.send(());

        Some(exec_id)
    }

    pub fn clear(&self, tab: TabId) {
        self.channel.publish_clear(tab);
        self.notify(tab);
    }

    pub fn pexec(&self, tab: TabId, line: &str) -> Option<ExecId> {
        self.exec(tab, line, ExecOptions::default())
    }

    pub fn qexec(&self, tab: TabId, line: &str) -> Option<ExecId> {
        self.exec(tab, line, ExecOptions::quiet())
    }

    /// Cancels the newest echoed execution of `tab`. With nothing in flight
    /// a bare cancellation is published so the active input is abandoned.
    pub fn interrupt(&self, tab: TabId) -> ExecId {
        let interrupted = {
            let mut table = lock(&self.running);
            let newest = table
                .iter()
                .filter(|(_, exec)| exec.tab == tab && exec.echo)
                .max_by_key(|(_, exec)| exec.order)
                .map(|(exec_id, _)| *exec_id);
            newest.and_then(|exec_id| table.remove(&exec_id).map(|exec| (exec_id, exec)))
        };

        let exec_id = match interrupted {
            Some((exec_id, exec)) => {
                exec.abort.abort();
                info!(%tab, %exec_id, "interrupted");
                exec_id
            }
            None => {
                let exec_id = ExecId::new();
                debug!(%tab, %exec_id, "bare cancellation");
                exec_id
            }
        };

        self.channel
            .publish_complete(tab, CommandComplete::cancellation(exec_id));
        self.notify(tab);
        exec_id
    }

    #[cfg(test)]
    pub fn in_flight(&self, tab: TabId) -> usize {
        lock(&self.running)
            .values()
            .filter(|exec| exec.tab == tab)
            .count()
    }

    pub fn abandon_tab(&self, tab: TabId) -> usize {
        let mut table = lock(&self.running);
        let before = table.len();
        table.retain(|_, exec| {
            if exec.tab == tab {
                exec.abort.abort();
                false
            } else {
                true
            }
        });
        let abandoned = before - table.len();
        if abandoned > 0 {
            warn!(%tab, abandoned, "aborted executions of closed tab");
        }
        abandoned
    }

    fn expand_aliases(&self, line: &str) -> String {
        let trimmed = line.trim();
        let (head, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        match self.aliases.get(head) {
            Some(expansion) if rest.is_empty() => expansion.clone(),
            Some(expansion) => format!("{expansion} {}", rest.trim_start()),
            None => trimmed.to_string(),
        }
    }

    fn notify(&self, tab: TabId) {
        if let Some(wake) = &self.wake {
            let _ = wake.send(tab);
        }
    }
}

fn lock(running: &RunningTable) -> std::sync::MutexGuard<'_, HashMap<ExecId, RunningExec>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_shell(shell: &str, command: &str) -> Result<Response> {
    let output = TokioCommand::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to execute {shell} for '{command}'"))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(response_from_output(output.status, &stdout, &stderr))
}

fn response_from_output(status: ExitStatus, stdout: &str, stderr: &str) -> Response {
    if !status.success() {
        let detail = if !stderr.trim().is_empty() {
            stderr.trim_end()
        } else {
            stdout.trim_end()
        };
        return if detail.is_empty() {
            Response::Error(format!("command exited with {status}"))
        } else {
            Response::Error(detail.to_string())
        };
    }

    let trimmed = stdout.trim();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
    {
        return Response::Structured(value);
    }

    if trimmed.is_empty() && stderr.trim().is_empty() {
        return Response::Bool(true);
    }

    let rendered = if stderr.trim().is_empty() {
        stdout.trim_end().to_string()
    } else if trimmed.is_empty() {
        stderr.trim_end().to_string()
    } else {
        format!("{}\n{}", stdout.trim_end(), stderr.trim_end())
    };
    Response::Text(rendered)
}

#[cfg(test)]
mod tests {
    use super::ShellRepl;
    use crate::channel::{CommandComplete, EventChannel, Message, Subscription, Topic};
    use crate::model::{Response, ResponseKind, TabId};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const TAB: TabId = TabId(1);
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn next_message(
        subscription: &mut Subscription,
        wake: &mut mpsc::UnboundedReceiver<TabId>,
    ) -> Message {
        loop {
            if let Some(envelope) = subscription.try_next().expect("channel open") {
                return envelope.message;
            }
            timeout(TEST_TIMEOUT, wake.recv())
                .await
                .expect("wake timed out")
                .expect("wake channel open");
        }
    }

    fn repl(channel: &EventChannel) -> (ShellRepl, mpsc::UnboundedReceiver<TabId>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        (ShellRepl::new(channel.clone(), "sh").with_wake(wake_tx), wake_rx)
    }

    #[tokio::test]
    async fn exec_publishes_start_then_completion() {
        let channel = EventChannel::new();
        let mut starts = channel.subscribe(Topic::CommandStart(TAB));
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        let exec_id = repl.pexec(TAB, "echo hello").expect("exec id");

        match next_message(&mut starts, &mut wake).await {
            Message::Start(start) => {
                assert_eq!(start.exec_id, exec_id);
                assert_eq!(start.command, "echo hello");
                assert!(start.echo);
            }
            other => panic!("unexpected message {other:?}"),
        }
        match next_message(&mut completes, &mut wake).await {
            Message::Complete(complete) => {
                assert_eq!(complete.exec_id, exec_id);
                assert!(!complete.cancelled);
                assert_eq!(complete.response, Response::Text("hello".to_string()));
                assert_eq!(complete.response_kind, ResponseKind::Scalar);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(repl.in_flight(TAB), 0);
    }

    #[tokio::test]
    async fn qexec_marks_events_without_echo() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        repl.qexec(TAB, "echo '[{\"name\":\"web\"}]'");
        match next_message(&mut completes, &mut wake).await {
            Message::Complete(complete) => {
                assert!(!complete.echo);
                assert_eq!(complete.response_kind, ResponseKind::Table);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_command_reports_error_response() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        repl.pexec(TAB, "echo broken >&2; exit 3");
        match next_message(&mut completes, &mut wake).await {
            Message::Complete(complete) => {
                assert_eq!(complete.response, Response::Error("broken".to_string()));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_cancels_running_exec_exactly_once() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        let exec_id = repl.pexec(TAB, "sleep 30").expect("exec id");
        assert_eq!(repl.in_flight(TAB), 1);
        assert_eq!(repl.interrupt(TAB), exec_id);
        assert_eq!(repl.in_flight(TAB), 0);

        match next_message(&mut completes, &mut wake).await {
            Message::Complete(complete) => {
                assert_eq!(complete.exec_id, exec_id);
                assert!(complete.cancelled);
            }
            other => panic!("unexpected message {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(completes.try_next().expect("channel open").is_none());
    }

    #[tokio::test]
    async fn interrupt_without_running_exec_is_a_bare_cancellation() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        let exec_id = repl.interrupt(TAB);
        match next_message(&mut completes, &mut wake).await {
            Message::Complete(complete) => {
                assert_eq!(complete.exec_id, exec_id);
                assert!(complete.cancelled);
                assert!(complete.echo);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_builtin_publishes_clear_only() {
        let channel = EventChannel::new();
        let mut clears = channel.subscribe(Topic::TerminalClear(TAB));
        let mut starts = channel.subscribe(Topic::CommandStart(TAB));
        let (repl, mut wake) = repl(&channel);

        assert_eq!(repl.pexec(TAB, "  clear "), None);
        assert_eq!(next_message(&mut clears, &mut wake).await, Message::Clear);
        assert!(starts.try_next().expect("channel open").is_none());
    }

    async fn completion_of(
        repl: &ShellRepl,
        completes: &mut Subscription,
        wake: &mut mpsc::UnboundedReceiver<TabId>,
        line: &str,
    ) -> CommandComplete {
        let exec_id = repl.pexec(TAB, line).expect("exec id");
        match next_message(completes, wake).await {
            Message::Complete(complete) => {
                assert_eq!(complete.exec_id, exec_id);
                complete
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn aliases_expand_first_token() {
        let channel = EventChannel::new();
        let mut starts = channel.subscribe(Topic::CommandStart(TAB));
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (mut repl, mut wake) = repl(&channel);
        repl.set_aliases(HashMap::from([("greet".to_string(), "echo hi".to_string())]));

        let complete = completion_of(&repl, &mut completes, &mut wake, "greet there").await;
        assert_eq!(complete.response, Response::Text("hi there".to_string()));
        match next_message(&mut starts, &mut wake).await {
            Message::Start(start) => assert_eq!(start.command, "echo hi there"),
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(repl.expand_aliases("ls -la"), "ls -la");
    }

    #[tokio::test]
    async fn json_output_is_structured() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        let complete =
            completion_of(&repl, &mut completes, &mut wake, "echo '{\"kind\":\"Pod\"}'").await;
        assert_eq!(
            complete.response,
            Response::Structured(serde_json::json!({ "kind": "Pod" }))
        );
        assert_eq!(complete.response_kind, ResponseKind::Structured);

        let complete = completion_of(&repl, &mut completes, &mut wake, "true").await;
        assert_eq!(complete.response, Response::Bool(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_commands_complete_once_and_leave_no_entry() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, mut wake) = repl(&channel);

        for _ in 0..5 {
            repl.pexec(TAB, "true").expect("exec id");
        }
        let mut seen = Vec::new();
        while seen.len() < 5 {
            match next_message(&mut completes, &mut wake).await {
                Message::Complete(complete) => {
                    assert!(!complete.cancelled);
                    assert!(!seen.contains(&complete.exec_id));
                    seen.push(complete.exec_id);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(repl.in_flight(TAB), 0);
        assert!(completes.try_next().expect("channel open").is_none());
    }

    #[tokio::test]
    async fn abandon_tab_drops_running_execs_silently() {
        let channel = EventChannel::new();
        let mut completes = channel.subscribe(Topic::CommandComplete(TAB));
        let (repl, _wake) = repl(&channel);

        repl.pexec(TAB, "sleep 30");
        assert_eq!(repl.abandon_tab(TAB), 1);
        tokio::task::yield_now().await;
        assert!(completes.try_next().expect("channel open").is_none());
    }
}

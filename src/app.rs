use crate::block::Block;
use crate::channel::{EventChannel, Message, Subscription, Topic};
use crate::config::RuntimeConfigSnapshot;
use crate::history::{CommandHistory, DEFAULT_HISTORY_LIMIT};
use crate::input::Action;
use crate::model::{ExecId, InlinePolicy, Response, TabId};
use crate::terminal::{Terminal, TerminalEffect, TerminalOptions};
use crate::viewport::{Bounds, FocusRequest, LayoutProbe};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const MAX_TABS: usize = 9;
const SCROLL_PAGE: u16 = 10;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Focus {
    ActiveBlock,
    RawInput,
    Block(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    Exec { tab: TabId, line: String },
    Interrupt { tab: TabId },
    ClearTerminal { tab: TabId },
    RefreshSidecar { tab: TabId, command: String },
    AbandonTab { tab: TabId },
}

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub prompt: String,
    pub popup: bool,
    pub policy: InlinePolicy,
    pub history_limit: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            prompt: "❯".to_string(),
            popup: false,
            policy: InlinePolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Geometry recorded by the renderer for the active tab.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LayoutSnapshot {
    pub active_block: Option<Bounds>,
    pub viewport_height: i32,
    pub raw_input: bool,
}

impl LayoutProbe for LayoutSnapshot {
    fn active_block_bounds(&self) -> Option<Bounds> {
        self.active_block
    }

    fn viewport_height(&self) -> i32 {
        self.viewport_height
    }

    fn has_raw_text_input(&self) -> bool {
        self.raw_input
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidecar {
    visible: bool,
    tab: Option<TabId>,
    command: String,
    body: String,
    error: bool,
}

impl Sidecar {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    fn show(&mut self, tab: TabId, command: String, response: &Response) {
        self.visible = true;
        self.tab = Some(tab);
        self.command = command;
        self.body = response.summary();
        self.error = matches!(response, Response::Error(_));
    }
}

struct TabView {
    id: TabId,
    terminal: Terminal,
    completions: Subscription,
    history: CommandHistory,
    focus: Focus,
    scroll: u16,
}

pub struct App {
    running: bool,
    channel: EventChannel,
    tabs: Vec<TabView>,
    active_tab: usize,
    next_tab_id: u32,
    prompt: String,
    popup: bool,
    policy: InlinePolicy,
    history_limit: usize,
    sidecar: Sidecar,
    status: String,
    show_help: bool,
    layout: LayoutSnapshot,
    refreshes: HashMap<ExecId, (TabId, String)>,
    cleared_tx: mpsc::UnboundedSender<TabId>,
    cleared_rx: mpsc::UnboundedReceiver<TabId>,
}

impl App {
    pub fn new(channel: EventChannel, options: AppOptions, initial_tabs: usize) -> Self {
        let (cleared_tx, cleared_rx) = mpsc::unbounded_channel();
        let mut app = Self {
            running: true,
            channel,
            tabs: Vec::new(),
            active_tab: 0,
            next_tab_id: 1,
            prompt: options.prompt,
            popup: options.popup,
            policy: options.policy,
            history_limit: options.history_limit,
            sidecar: Sidecar::default(),
            status: "Ready".to_string(),
            show_help: false,
            layout: LayoutSnapshot::default(),
            refreshes: HashMap::new(),
            cleared_tx,
            cleared_rx,
        };
        for _ in 0..initial_tabs.clamp(1, MAX_TABS) {
            app.open_tab();
        }
        app.active_tab = 0;
        app
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn popup(&self) -> bool {
        self.popup
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.iter().map(|tab| tab.id).collect()
    }

    pub fn active_tab_index(&self) -> usize {
        self.active_tab
    }

    pub fn active_tab_id(&self) -> TabId {
        self.tab().id
    }

    pub fn blocks(&self) -> Arc<Vec<Block>> {
        self.tab().terminal.snapshot()
    }

    pub fn active_input(&self) -> Option<&str> {
        self.tab().terminal.active_input()
    }

    pub fn active_block_index(&self) -> Option<usize> {
        self.tab().terminal.active_index()
    }

    pub fn focus(&self) -> Focus {
        self.tab().focus
    }

    pub fn scroll(&self) -> u16 {
        self.tab().scroll
    }

    pub fn sidecar(&self) -> &Sidecar {
        &self.sidecar
    }

    pub fn is_sidecar_visible(&self) -> bool {
        self.sidecar.visible
    }

    pub fn close_sidecar(&mut self) {
        self.sidecar.visible = false;
    }

    pub fn set_layout(&mut self, layout: LayoutSnapshot) {
        self.layout = layout;
    }

    pub fn apply_config(&mut self, config: &RuntimeConfigSnapshot, popup_forced: bool) {
        self.prompt = config.prompt.clone();
        self.popup = popup_forced || config.popup;
        self.policy = InlinePolicy {
            inline_scalar_responses: config.inline_scalar_responses,
        };
        self.history_limit = config.history_limit;
        for tab in &mut self.tabs {
            tab.terminal.set_policy(self.policy);
            tab.terminal.set_popup(self.popup);
            tab.history.set_limit(self.history_limit);
        }
    }

    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        let mut sidecar_updates = Vec::new();

        for tab in &mut self.tabs {
            let applied = tab.terminal.pump();
            loop {
                match tab.completions.try_next() {
                    Ok(Some(envelope)) => {
                        let Message::Complete(event) = envelope.message else {
                            continue;
                        };
                        if event.cancelled {
                            self.refreshes.remove(&event.exec_id);
                            continue;
                        }
                        let refreshed = !event.echo;
                        let command = if event.echo {
                            if self.policy.shows_inline(
                                event.response_kind,
                                &event.evaluator_options,
                                &event.exec_options,
                            ) {
                                continue;
                            }
                            match finished_command(tab.terminal.blocks(), event.exec_id) {
                                Some(command) => command,
                                None => {
                                    debug!(
                                        tab = %tab.id,
                                        exec_id = %event.exec_id,
                                        "completion has no finished block, sidecar unchanged"
                                    );
                                    continue;
                                }
                            }
                        } else {
                            match self.refreshes.remove(&event.exec_id) {
                                Some((_, command)) => command,
                                None => continue,
                            }
                        };
                        sidecar_updates.push((tab.id, command, event.response, refreshed));
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(tab = %tab.id, "sidecar feed closed: {error}");
                        break;
                    }
                }
            }

            if applied > 0 {
                tab.terminal.on_output_render();
                if let Focus::Block(index) = tab.focus
                    && index >= tab.terminal.blocks().len()
                {
                    tab.focus = Focus::ActiveBlock;
                }
            }
            handled += applied;
        }

        for (tab, command, response, refreshed) in sidecar_updates {
            if refreshed {
                self.status = format!("Refreshed '{command}'");
            }
            self.sidecar.show(tab, command, &response);
        }

        while let Ok(tab_id) = self.cleared_rx.try_recv() {
            if let Some(tab) = self.tabs.iter_mut().find(|tab| tab.id == tab_id) {
                tab.scroll = 0;
                tab.focus = Focus::ActiveBlock;
                tab.history.reset();
            }
        }

        handled
    }

    /// Call after a frame has been drawn so the layout is current.
    pub fn apply_effects(&mut self) -> bool {
        let active_tab = self.active_tab;
        let mut applied = false;
        for index in 0..self.tabs.len() {
            let effects = self.tabs[index].terminal.take_effects();
            applied |= !effects.is_empty();
            for effect in effects {
                match effect {
                    TerminalEffect::CloseSidecar => {
                        if self.is_sidecar_visible() {
                            self.close_sidecar();
                        }
                    }
                    TerminalEffect::ScrollToBottom => {
                        if !matches!(self.tabs[index].focus, Focus::Block(_)) {
                            self.tabs[index].scroll = 0;
                        }
                    }
                    TerminalEffect::RefocusActive => {
                        let tab = &mut self.tabs[index];
                        tab.focus = if index == active_tab {
                            match tab.terminal.focus_active_block(&self.layout) {
                                FocusRequest::ActiveBlock(_) => Focus::ActiveBlock,
                                FocusRequest::RawTextInput => Focus::RawInput,
                                FocusRequest::None => tab.focus,
                            }
                        } else {
                            Focus::ActiveBlock
                        };
                    }
                }
            }
        }
        applied
    }

    /// Routes the echo-less completion of `exec_id` to the sidecar.
    pub fn track_refresh(&mut self, exec_id: ExecId, tab: TabId, command: String) {
        self.refreshes.insert(exec_id, (tab, command));
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Action::InputChar(c) => {
                let mut text = self.active_input().unwrap_or_default().to_string();
                text.push(c);
                self.edit_input(text);
                AppCommand::None
            }
            Action::Backspace => {
                let mut text = self.active_input().unwrap_or_default().to_string();
                text.pop();
                self.edit_input(text);
                AppCommand::None
            }
            Action::ClearLine => {
                self.edit_input(String::new());
                AppCommand::None
            }
            Action::SubmitInput => self.submit_input(),
            Action::Interrupt => {
                let tab = self.active_tab_id();
                self.tab_mut().history.reset();
                AppCommand::Interrupt { tab }
            }
            Action::ClearTerminal => AppCommand::ClearTerminal {
                tab: self.active_tab_id(),
            },
            Action::HistoryPrev => {
                let current = self.active_input().unwrap_or_default().to_string();
                let recalled = self.tab_mut().history.previous(&current).map(str::to_string);
                if let Some(recalled) = recalled {
                    self.edit_input(recalled);
                }
                AppCommand::None
            }
            Action::HistoryNext => {
                let recalled = self.tab_mut().history.next().map(str::to_string);
                if let Some(recalled) = recalled {
                    self.edit_input(recalled);
                }
                AppCommand::None
            }
            Action::SelectPrevBlock => {
                self.select_block(-1);
                AppCommand::None
            }
            Action::SelectNextBlock => {
                self.select_block(1);
                AppCommand::None
            }
            Action::RemoveSelectedBlock => {
                self.remove_selected_block();
                AppCommand::None
            }
            Action::FocusActive => {
                self.tab_mut().terminal.will_lose_focus();
                AppCommand::None
            }
            Action::PageUp => {
                let tab = self.tab_mut();
                tab.scroll = tab.scroll.saturating_add(SCROLL_PAGE);
                AppCommand::None
            }
            Action::PageDown => {
                let tab = self.tab_mut();
                tab.scroll = tab.scroll.saturating_sub(SCROLL_PAGE);
                AppCommand::None
            }
            Action::ToggleSidecar => {
                if self.sidecar.command.is_empty() && !self.sidecar.visible {
                    self.status = "Sidecar is empty".to_string();
                } else {
                    self.sidecar.visible = !self.sidecar.visible;
                }
                AppCommand::None
            }
            Action::RefreshSidecar => match self.sidecar.tab {
                Some(tab) if !self.sidecar.command.is_empty() => {
                    self.status = format!("Refreshing '{}'", self.sidecar.command);
                    AppCommand::RefreshSidecar {
                        tab,
                        command: self.sidecar.command.clone(),
                    }
                }
                _ => {
                    self.status = "Nothing to refresh".to_string();
                    AppCommand::None
                }
            },
            Action::NewTab => {
                if self.tabs.len() >= MAX_TABS {
                    self.status = format!("At most {MAX_TABS} tabs");
                } else {
                    self.active_tab = self.open_tab();
                    self.status = format!("Opened tab {}", self.active_tab_id());
                }
                AppCommand::None
            }
            Action::CloseTab => self.close_active_tab(),
            Action::NextTab => {
                self.active_tab = (self.active_tab + 1) % self.tabs.len();
                AppCommand::None
            }
            Action::PrevTab => {
                self.active_tab = (self.active_tab + self.tabs.len() - 1) % self.tabs.len();
                AppCommand::None
            }
            Action::SwitchTab(number) => {
                let index = usize::from(number).saturating_sub(1);
                if number > 0 && index < self.tabs.len() {
                    self.active_tab = index;
                } else {
                    self.status = format!("No tab {number}");
                }
                AppCommand::None
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
        }
    }

    fn open_tab(&mut self) -> usize {
        let id = TabId(self.next_tab_id);
        self.next_tab_id += 1;
        let cleared_tx = self.cleared_tx.clone();
        let terminal = Terminal::attach(
            id,
            &self.channel,
            TerminalOptions {
                popup: self.popup,
                policy: self.policy,
                on_clear: Some(Box::new(move |tab| {
                    let _ = cleared_tx.send(tab);
                })),
            },
        );
        self.tabs.push(TabView {
            id,
            terminal,
            completions: self.channel.subscribe(Topic::CommandComplete(id)),
            history: CommandHistory::new(self.history_limit),
            focus: Focus::ActiveBlock,
            scroll: 0,
        });
        self.tabs.len() - 1
    }

    fn close_active_tab(&mut self) -> AppCommand {
        if self.tabs.len() <= 1 {
            self.status = "Cannot close the last tab".to_string();
            return AppCommand::None;
        }
        let mut closed = self.tabs.remove(self.active_tab);
        closed.terminal.teardown();
        if self.sidecar.tab == Some(closed.id) {
            self.sidecar = Sidecar::default();
        }
        self.refreshes.retain(|_, (tab, _)| *tab != closed.id);
        self.active_tab = self.active_tab.min(self.tabs.len() - 1);
        self.status = format!("Closed tab {}", closed.id);
        AppCommand::AbandonTab { tab: closed.id }
    }

    fn submit_input(&mut self) -> AppCommand {
        let Some(line) = self.active_input().map(|input| input.trim().to_string()) else {
            self.status = "A command is still running (Ctrl-C to interrupt)".to_string();
            return AppCommand::None;
        };
        if line.is_empty() {
            return AppCommand::None;
        }

        let tab = self.tab_mut();
        tab.history.push(&line);
        tab.scroll = 0;
        tab.focus = Focus::ActiveBlock;
        AppCommand::Exec {
            tab: tab.id,
            line,
        }
    }

    fn edit_input(&mut self, text: String) {
        let tab = self.tab_mut();
        if tab.terminal.update_input(text) {
            tab.scroll = 0;
        } else {
            self.status = "A command is still running (Ctrl-C to interrupt)".to_string();
        }
    }

    fn select_block(&mut self, delta: isize) {
        let tab = self.tab_mut();
        let blocks = tab.terminal.blocks();
        let history_len = blocks.iter().filter(|block| !block.is_active()).count();
        if history_len == 0 {
            return;
        }

        let next = match (tab.focus, delta.is_negative()) {
            (Focus::Block(index), true) => Some(index.saturating_sub(1)),
            (Focus::Block(index), false) if index + 1 < history_len => Some(index + 1),
            (Focus::Block(_), false) => None,
            (_, true) => Some(history_len - 1),
            (_, false) => return,
        };

        match next {
            Some(index) => tab.focus = Focus::Block(index),
            None => tab.terminal.will_lose_focus(),
        }
    }

    fn remove_selected_block(&mut self) {
        let tab = self.tab_mut();
        let Focus::Block(index) = tab.focus else {
            return;
        };
        tab.terminal.will_remove(index);

        let history_len = tab
            .terminal
            .blocks()
            .iter()
            .filter(|block| !block.is_active())
            .count();
        if history_len == 0 {
            tab.focus = Focus::ActiveBlock;
        } else {
            tab.focus = Focus::Block(index.min(history_len - 1));
        }
    }

    fn tab(&self) -> &TabView {
        &self.tabs[self.active_tab]
    }

    fn tab_mut(&mut self) -> &mut TabView {
        &mut self.tabs[self.active_tab]
    }
}

fn finished_command(blocks: &[Block], exec_id: ExecId) -> Option<String> {
    blocks
        .iter()
        .find(|block| block.is_finished() && block.exec_id() == Some(exec_id))
        .map(|block| block.command().to_string())
}

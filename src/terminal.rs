use crate::block::{Block, Outcome, TransitionError};
use crate::channel::{
    CommandComplete, CommandStart, Envelope, EventChannel, Message, Subscription, Topic,
};
use crate::model::{ExecId, InlinePolicy, TabId};
use crate::viewport::{FocusRequest, LayoutProbe, decide_focus};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TerminalError {
    #[error("no processing block matches exec id {0}")]
    UnmatchedCompletion(ExecId),
    #[error("exec id {0} is already processing")]
    DuplicateExecId(ExecId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("block index {index} out of range ({len} blocks)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("terminal has no blocks")]
    Empty,
}

/// Follow-up work for the rendering layer, applied after its current pass.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TerminalEffect {
    CloseSidecar,
    ScrollToBottom,
    RefocusActive,
}

pub type ClearCallback = Box<dyn FnMut(TabId) + Send>;

#[derive(Default)]
pub struct TerminalOptions {
    /// Constrained display mode; starting a command closes an open sidecar.
    pub popup: bool,
    pub policy: InlinePolicy,
    pub on_clear: Option<ClearCallback>,
}

pub struct Terminal {
    tab: TabId,
    blocks: Arc<Vec<Block>>,
    subscriptions: Vec<Subscription>,
    popup: bool,
    policy: InlinePolicy,
    on_clear: Option<ClearCallback>,
    effects: VecDeque<TerminalEffect>,
}

impl Terminal {
    pub fn attach(tab: TabId, channel: &EventChannel, options: TerminalOptions) -> Self {
        Self::with_blocks(tab, channel, options, vec![Block::active(None)])
    }

    pub(crate) fn with_blocks(
        tab: TabId,
        channel: &EventChannel,
        options: TerminalOptions,
        blocks: Vec<Block>,
    ) -> Self {
        let subscriptions = Topic::for_tab(tab)
            .into_iter()
            .map(|topic| channel.subscribe(topic))
            .collect::<Vec<_>>();
        info!(%tab, "terminal attached");

        Self {
            tab,
            blocks: Arc::new(blocks),
            subscriptions,
            popup: options.popup,
            policy: options.policy,
            on_clear: options.on_clear,
            effects: VecDeque::new(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn snapshot(&self) -> Arc<Vec<Block>> {
        Arc::clone(&self.blocks)
    }

    pub fn set_policy(&mut self, policy: InlinePolicy) {
        self.policy = policy;
    }

    pub fn set_popup(&mut self, popup: bool) {
        self.popup = popup;
    }

    pub fn active_index(&self) -> Option<usize> {
        self.blocks.iter().rposition(Block::is_active)
    }

    pub fn active_input(&self) -> Option<&str> {
        self.active_index().map(|index| self.blocks[index].input())
    }

    pub fn update_input(&mut self, text: impl Into<String>) -> bool {
        let Some(index) = self.active_index() else {
            return false;
        };
        Arc::make_mut(&mut self.blocks)[index].set_input(text);
        true
    }

    /// Applies queued events in publish order.
    pub fn pump(&mut self) -> usize {
        let mut pending = Vec::new();
        for subscription in &mut self.subscriptions {
            loop {
                match subscription.try_next() {
                    Ok(Some(envelope)) => pending.push(envelope),
                    Ok(None) => break,
                    Err(error) => {
                        warn!(tab = %self.tab, "{error}");
                        break;
                    }
                }
            }
        }
        pending.sort_by_key(|envelope: &Envelope| envelope.sequence);

        let handled = pending.len();
        for envelope in pending {
            self.dispatch(envelope.message);
        }
        handled
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Start(event) => self.on_exec_start(&event),
            Message::Complete(event) => self.on_exec_end(&event),
            Message::Clear => self.clear(),
        }
    }

    pub fn clear(&mut self) {
        let captured = self
            .active_input()
            .filter(|input| !input.is_empty())
            .map(str::to_string);
        self.commit(vec![Block::active(captured.as_deref())]);
        info!(tab = %self.tab, "terminal cleared");

        if let Some(on_clear) = self.on_clear.as_mut() {
            on_clear(self.tab);
        }
    }

    pub fn on_exec_start(&mut self, event: &CommandStart) {
        if !event.echo {
            debug!(tab = %self.tab, exec_id = %event.exec_id, "ignoring start without echo");
            return;
        }

        match self.started(event) {
            Ok(blocks) => {
                self.commit(blocks);
                if self.popup {
                    self.effects.push_back(TerminalEffect::CloseSidecar);
                }
                debug!(tab = %self.tab, exec_id = %event.exec_id, command = %event.command, "processing");
            }
            Err(error) => {
                error!(tab = %self.tab, exec_id = %event.exec_id, "start rejected: {error}");
            }
        }
    }

    fn started(&self, event: &CommandStart) -> Result<Vec<Block>, TerminalError> {
        if self.processing_index(event.exec_id).is_some() {
            return Err(TerminalError::DuplicateExecId(event.exec_id));
        }

        let mut blocks = self.blocks.as_ref().clone();
        let target = match blocks.pop() {
            Some(last) if last.is_active() => last,
            Some(last) => {
                blocks.push(last);
                Block::active(None)
            }
            None => Block::active(None),
        };
        blocks.push(Block::processing(target, &event.command, event.exec_id)?);
        Ok(blocks)
    }

    pub fn on_exec_end(&mut self, event: &CommandComplete) {
        if !event.echo {
            debug!(tab = %self.tab, exec_id = %event.exec_id, "ignoring completion without echo");
            return;
        }

        match self.completed(event) {
            Ok(blocks) => {
                self.commit(blocks);
                debug!(
                    tab = %self.tab,
                    exec_id = %event.exec_id,
                    cancelled = event.cancelled,
                    kind = event.response_kind.label(),
                    "completed"
                );
            }
            Err(TerminalError::UnmatchedCompletion(exec_id)) => {
                warn!(tab = %self.tab, %exec_id, "completion does not match any processing block");
            }
            Err(error) => {
                error!(tab = %self.tab, exec_id = %event.exec_id, "completion rejected: {error}");
            }
        }
    }

    fn completed(&self, event: &CommandComplete) -> Result<Vec<Block>, TerminalError> {
        let mut blocks = self.blocks.as_ref().clone();

        match self.processing_index(event.exec_id) {
            Some(index) => {
                let outcome = if self.policy.shows_inline(
                    event.response_kind,
                    &event.evaluator_options,
                    &event.exec_options,
                ) {
                    Outcome::Response(event.response.clone())
                } else {
                    Outcome::Ok
                };
                let previous = blocks.remove(index);
                blocks.insert(index, Block::finished(previous, outcome, event.cancelled)?);
            }
            None if event.cancelled => {
                let last = blocks.pop().ok_or(TerminalError::Empty)?;
                blocks.push(Block::cancelled(last)?);
            }
            None => return Err(TerminalError::UnmatchedCompletion(event.exec_id)),
        }

        if !blocks.last().is_some_and(Block::is_active) {
            blocks.push(Block::active(None));
        }
        Ok(blocks)
    }

    pub fn remove_block(&mut self, index: usize) -> Result<Block, TerminalError> {
        let len = self.blocks.len();
        if index >= len {
            return Err(TerminalError::IndexOutOfRange { index, len });
        }

        let mut blocks = self.blocks.as_ref().clone();
        let removed = blocks.remove(index);
        if !blocks.iter().any(Block::is_active) {
            blocks.push(Block::active(None));
        }
        self.commit(blocks);
        debug!(tab = %self.tab, index, "block removed");
        Ok(removed)
    }

    pub fn will_remove(&mut self, index: usize) {
        if let Err(error) = self.remove_block(index) {
            warn!(tab = %self.tab, "remove ignored: {error}");
        }
    }

    pub fn will_lose_focus(&mut self) {
        self.schedule(TerminalEffect::RefocusActive);
    }

    pub fn on_output_render(&mut self) {
        self.schedule(TerminalEffect::ScrollToBottom);
    }

    pub fn focus_active_block(&self, layout: &impl LayoutProbe) -> FocusRequest {
        decide_focus(self.active_index(), layout)
    }

    pub fn take_effects(&mut self) -> Vec<TerminalEffect> {
        self.effects.drain(..).collect()
    }

    pub fn teardown(&mut self) -> usize {
        if self.subscriptions.is_empty() {
            return 0;
        }
        let released = self
            .subscriptions
            .drain(..)
            .map(Subscription::release)
            .filter(|removed| *removed)
            .count();
        info!(tab = %self.tab, released, "terminal detached");
        released
    }

    /// At most one active block, and it is last; otherwise the last block is
    /// processing. Processing exec ids are unique.
    pub fn is_consistent(blocks: &[Block]) -> bool {
        let active = blocks.iter().filter(|block| block.is_active()).count();
        let tail_ok = match blocks.last() {
            Some(last) => last.is_active() || (active == 0 && last.is_processing()),
            None => false,
        };

        let mut seen = HashSet::new();
        let unique_ids = blocks
            .iter()
            .filter(|block| block.is_processing())
            .filter_map(Block::exec_id)
            .all(|exec_id| seen.insert(exec_id));

        active <= 1 && tail_ok && unique_ids
    }

    fn processing_index(&self, exec_id: ExecId) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| block.is_processing() && block.exec_id() == Some(exec_id))
    }

    fn schedule(&mut self, effect: TerminalEffect) {
        if !self.effects.contains(&effect) {
            self.effects.push_back(effect);
        }
    }

    fn commit(&mut self, blocks: Vec<Block>) {
        if !Self::is_consistent(&blocks) {
            warn!(tab = %self.tab, blocks = blocks.len(), "block sequence violates active invariant");
        }
        self.blocks = Arc::new(blocks);
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.teardown();
    }
}

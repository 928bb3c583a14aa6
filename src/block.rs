use crate::model::{ExecId, Response};
use chrono::{DateTime, Local};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Response(Response),
    /// Ran without a response worth keeping in the block; viewed elsewhere.
    Ok,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockState {
    Active,
    Processing {
        command: String,
        exec_id: ExecId,
        started_at: DateTime<Local>,
    },
    Finished {
        command: String,
        exec_id: ExecId,
        outcome: Outcome,
        cancelled: bool,
        started_at: DateTime<Local>,
        completed_at: DateTime<Local>,
    },
    Cancelled {
        command: Option<String>,
        exec_id: Option<ExecId>,
    },
}

impl BlockState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Processing { .. } => "processing",
            Self::Finished { .. } => "finished",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("cannot transition block from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    input: String,
    state: BlockState,
}

impl Block {
    pub fn active(captured: Option<&str>) -> Self {
        Self {
            input: captured.unwrap_or_default().to_string(),
            state: BlockState::Active,
        }
    }

    pub fn processing(
        previous: Block,
        command: impl Into<String>,
        exec_id: ExecId,
    ) -> Result<Self, TransitionError> {
        match previous.state {
            BlockState::Active => Ok(Self {
                input: previous.input,
                state: BlockState::Processing {
                    command: command.into(),
                    exec_id,
                    started_at: Local::now(),
                },
            }),
            other => Err(TransitionError {
                from: other.name(),
                to: "processing",
            }),
        }
    }

    pub fn finished(
        previous: Block,
        outcome: Outcome,
        cancelled: bool,
    ) -> Result<Self, TransitionError> {
        match previous.state {
            BlockState::Processing {
                command,
                exec_id,
                started_at,
            } => Ok(Self {
                input: previous.input,
                state: BlockState::Finished {
                    command,
                    exec_id,
                    outcome,
                    cancelled,
                    started_at,
                    completed_at: Local::now(),
                },
            }),
            other => Err(TransitionError {
                from: other.name(),
                to: "finished",
            }),
        }
    }

    pub fn cancelled(previous: Block) -> Result<Self, TransitionError> {
        let state = match previous.state {
            BlockState::Active => BlockState::Cancelled {
                command: None,
                exec_id: None,
            },
            BlockState::Processing {
                command, exec_id, ..
            } => BlockState::Cancelled {
                command: Some(command),
                exec_id: Some(exec_id),
            },
            other => {
                return Err(TransitionError {
                    from: other.name(),
                    to: "cancelled",
                });
            }
        };
        Ok(Self {
            input: previous.input,
            state,
        })
    }

    pub fn state(&self) -> &BlockState {
        &self.state
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub(crate) fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, BlockState::Active)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state, BlockState::Processing { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, BlockState::Finished { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.state {
            BlockState::Cancelled { .. } => true,
            BlockState::Finished { cancelled, .. } => *cancelled,
            _ => false,
        }
    }

    pub fn exec_id(&self) -> Option<ExecId> {
        match &self.state {
            BlockState::Processing { exec_id, .. } | BlockState::Finished { exec_id, .. } => {
                Some(*exec_id)
            }
            BlockState::Cancelled { exec_id, .. } => *exec_id,
            BlockState::Active => None,
        }
    }

    pub fn command(&self) -> &str {
        match &self.state {
            BlockState::Processing { command, .. } | BlockState::Finished { command, .. } => {
                command
            }
            BlockState::Cancelled {
                command: Some(command),
                ..
            } => command,
            _ => &self.input,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.state {
            BlockState::Finished { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match &self.state {
            BlockState::Finished {
                started_at,
                completed_at,
                ..
            } => Some((*completed_at - *started_at).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Block, BlockState, Outcome};
    use crate::model::{ExecId, Response};

    #[test]
    fn active_block_is_prefilled_with_captured_text() {
        let block = Block::active(Some("kubectl get po"));
        assert!(block.is_active());
        assert_eq!(block.input(), "kubectl get po");
        assert_eq!(Block::active(None).input(), "");
    }

    #[test]
    fn full_lifecycle_keeps_input_and_exec_id() {
        let exec_id = ExecId::new();
        let processing =
            Block::processing(Block::active(Some("ls")), "ls -la", exec_id).expect("processing");
        assert!(processing.is_processing());
        assert_eq!(processing.exec_id(), Some(exec_id));
        assert_eq!(processing.command(), "ls -la");
        assert_eq!(processing.input(), "ls");

        let finished = Block::finished(
            processing,
            Outcome::Response(Response::Text("ok".to_string())),
            false,
        )
        .expect("finished");
        assert!(finished.is_finished());
        assert!(!finished.is_cancelled());
        assert_eq!(finished.exec_id(), Some(exec_id));
        assert_eq!(finished.input(), "ls");
        assert!(finished.duration_ms().is_some_and(|ms| ms >= 0));
    }

    #[test]
    fn finished_requires_processing_source() {
        let error = Block::finished(Block::active(None), Outcome::Ok, false)
            .expect_err("active cannot finish");
        assert_eq!(error.from, "active");
        assert_eq!(error.to, "finished");
    }

    #[test]
    fn processing_requires_active_source() {
        let processing =
            Block::processing(Block::active(None), "a", ExecId::new()).expect("processing");
        let error = Block::processing(processing, "b", ExecId::new())
            .expect_err("processing cannot restart");
        assert_eq!(error.from, "processing");
    }

    #[test]
    fn cancelling_an_active_block_keeps_typed_input() {
        let cancelled = Block::cancelled(Block::active(Some("half typed"))).expect("cancelled");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.input(), "half typed");
        assert_eq!(cancelled.exec_id(), None);
        assert_eq!(cancelled.command(), "half typed");
    }

    #[test]
    fn cancelling_a_processing_block_keeps_command() {
        let exec_id = ExecId::new();
        let processing =
            Block::processing(Block::active(None), "sleep 10", exec_id).expect("processing");
        let cancelled = Block::cancelled(processing).expect("cancelled");
        assert_eq!(
            cancelled.state(),
            &BlockState::Cancelled {
                command: Some("sleep 10".to_string()),
                exec_id: Some(exec_id),
            }
        );
    }

    #[test]
    fn finished_blocks_cannot_be_cancelled() {
        let processing =
            Block::processing(Block::active(None), "true", ExecId::new()).expect("processing");
        let finished = Block::finished(processing, Outcome::Ok, false).expect("finished");
        assert!(Block::cancelled(finished).is_err());
    }
}

//! The effectful collaborators handed to steps and to rollback.

use std::sync::Arc;

use crate::command_executor::{CommandBackend, CommandExecutor, SystemBackend};
use crate::fetch::{Fetcher, HttpFetcher, WebClient};
use crate::filesystem::{FileOps, FsBackend, LocalFs};
use crate::mode::{EffectGate, ExecutionMode, Journal};
use crate::run_state::RunState;

/// Executor, file operations and web client sharing one gate and journal.
#[derive(Debug, Clone)]
pub struct Toolkit {
    pub commands: CommandExecutor,
    pub files: FileOps,
    pub web: WebClient,
    journal: Arc<Journal>,
}

impl Toolkit {
    /// Tools backed by the real host.
    pub fn system(state: &RunState) -> Self {
        Self::with_backends(
            state,
            Arc::new(SystemBackend),
            Arc::new(LocalFs),
            Arc::new(HttpFetcher),
        )
    }

    /// Tools over explicit backends, gated by the state's mode, halt flag and
    /// effect lock.
    pub fn with_backends(
        state: &RunState,
        commands: Arc<dyn CommandBackend>,
        files: Arc<dyn FsBackend>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let journal = Arc::new(Journal::new());
        let gate = EffectGate::new(state.mode(), Arc::clone(&journal), state.halt_flag())
            .with_effect_lock(state.effect_lock());
        Self {
            commands: CommandExecutor::new(gate.clone(), commands),
            files: FileOps::new(gate.clone(), files),
            web: WebClient::new(gate, fetcher),
            journal,
        }
    }

    /// The same tools without the interrupt check, for compensating actions.
    pub fn detached(&self) -> Self {
        Self {
            commands: self.commands.detached(),
            files: self.files.detached(),
            web: self.web.detached(),
            journal: Arc::clone(&self.journal),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.commands.mode()
    }

    /// Effects described (not performed) so far in simulate mode
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }
}

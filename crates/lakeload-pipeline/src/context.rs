use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-run state handed from the orchestrator down to components and the
/// database gateway
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    /// Enumerate and plan, but issue no writes
    pub dry_run: bool,
    /// Recompute derived data even when it looks current
    pub force: bool,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel,
            dry_run: false,
            force: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

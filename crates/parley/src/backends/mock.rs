use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::base::{
    Backend, BackendKind, BackendRequest, Chunking, DeltaMode, RawRecord, RawStream,
};
use crate::errors::BackendError;

/// One step of a scripted transport
#[derive(Debug, Clone)]
pub enum Step {
    Record(RawRecord),
    Fail(BackendError),
    /// Never yields again, like a peer that stops sending
    Stall,
}

/// What one invocation attempt does: fail to start, or play the steps
pub type Script = Result<Vec<Step>, BackendError>;

/// Counts transports dropped, so tests can check nothing leaks
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A backend that replays pre-configured scripts, one per attempt
pub struct ScriptedBackend {
    scripts: Mutex<Vec<Script>>,
    kind: BackendKind,
    delta_mode: DeltaMode,
    chunking: Chunking,
    invocations: AtomicUsize,
    released: Arc<AtomicUsize>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            kind: BackendKind::Completion,
            delta_mode: DeltaMode::Incremental,
            chunking: Chunking::None,
            invocations: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A single successful attempt yielding the given text fragments
    pub fn fragments(fragments: &[&str]) -> Self {
        Self::new(vec![Ok(fragments
            .iter()
            .map(|f| Step::Record(RawRecord::Fragment(f.to_string())))
            .collect())])
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_delta_mode(mut self, delta_mode: DeltaMode) -> Self {
        self.delta_mode = delta_mode;
        self
    }

    pub fn with_chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of opened transports that have since been dropped
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn delta_mode(&self) -> DeltaMode {
        self.delta_mode
    }

    fn chunking(&self) -> Chunking {
        self.chunking
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<RawStream, BackendError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Return an empty transport if no more scripts are configured
                Ok(Vec::new())
            } else {
                scripts.remove(0)
            }
        };
        let steps = script?;
        let guard = ReleaseGuard(self.released.clone());

        let stream = async_stream::stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    Step::Record(record) => yield Ok(record),
                    Step::Fail(err) => {
                        yield Err(err);
                        return;
                    }
                    Step::Stall => futures::future::pending::<()>().await,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

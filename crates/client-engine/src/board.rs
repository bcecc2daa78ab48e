use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use pywren_client_core::keys::CallId;

use crate::api::{CallError, CallState};
use crate::backend::ActivationId;

/// Per-job scoreboard shared by the completion watcher, the invoke tasks and
/// the call handles.
///
/// The storage watcher knows which calls finished and marks them
/// individually; the broker watcher may only know *that* a call finished and
/// records it anonymously. A handle resolves once its own call is marked, or
/// once identified + anonymous + failed evidence covers the whole job.
pub(crate) struct CompletionBoard {
    job_id: String,
    total: u32,
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

struct Inner {
    done: HashSet<CallId>,
    anonymous: u32,
    activations: HashMap<CallId, ActivationId>,
    failed: HashMap<CallId, String>,
    job_failure: Option<String>,
}

impl Inner {
    fn resolved(&self) -> u32 {
        self.done.len() as u32 + self.anonymous + self.failed.len() as u32
    }
}

impl CompletionBoard {
    pub(crate) fn new(job_id: String, total: u32) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            job_id,
            total,
            inner: Mutex::new(Inner {
                done: HashSet::new(),
                anonymous: 0,
                activations: HashMap::new(),
                failed: HashMap::new(),
                job_failure: None,
            }),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("completion board lock poisoned")
    }

    fn bump(&self) {
        self.changed.send_modify(|rev| *rev += 1);
    }

    pub(crate) fn record_dispatch(&self, call_id: CallId, activation_id: ActivationId) {
        self.lock().activations.insert(call_id, activation_id);
        self.bump();
    }

    /// Mark every call in `done` as completed; returns how many were new.
    pub(crate) fn mark_done_set(&self, done: &HashSet<CallId>) -> u32 {
        let new = {
            let mut inner = self.lock();
            let before = inner.done.len();
            inner.done.extend(done.iter().copied());
            (inner.done.len() - before) as u32
        };
        if new > 0 {
            self.bump();
        }
        new
    }

    pub(crate) fn mark_done(&self, call_id: CallId) {
        if self.lock().done.insert(call_id) {
            self.bump();
        }
    }

    /// Record one completion whose call id is unknown.
    pub(crate) fn mark_anonymous(&self) {
        self.lock().anonymous += 1;
        self.bump();
    }

    pub(crate) fn fail_call(&self, call_id: CallId, reason: String) {
        self.lock().failed.insert(call_id, reason);
        self.bump();
    }

    pub(crate) fn fail_job(&self, reason: String) {
        let mut inner = self.lock();
        if inner.job_failure.is_none() {
            inner.job_failure = Some(reason);
            drop(inner);
            self.bump();
        }
    }

    pub(crate) fn activation_id(&self, call_id: CallId) -> Option<ActivationId> {
        self.lock().activations.get(&call_id).cloned()
    }

    /// Calls that have reached a terminal state: completed (identified or
    /// anonymous) or permanently failed. Failed calls never write a status
    /// record, so watcher termination is driven by this tally rather than by
    /// observed completions alone.
    pub(crate) fn resolved_count(&self) -> u32 {
        self.lock().resolved()
    }

    /// Wakes on every board change; used by watchers that otherwise block on
    /// an external signal source.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn result_of(&self, call_id: CallId) -> Option<Result<(), CallError>> {
        let inner = self.lock();
        if inner.done.contains(&call_id) {
            return Some(Ok(()));
        }
        if let Some(reason) = inner.failed.get(&call_id) {
            return Some(Err(CallError::CallFailed {
                call_id,
                reason: reason.clone(),
            }));
        }
        if let Some(reason) = &inner.job_failure {
            return Some(Err(CallError::JobFailed {
                job_id: self.job_id.clone(),
                reason: reason.clone(),
            }));
        }
        if inner.resolved() >= self.total {
            return Some(Ok(()));
        }
        None
    }

    pub(crate) fn state_of(&self, call_id: CallId) -> CallState {
        match self.result_of(call_id) {
            Some(Ok(())) => CallState::Done,
            Some(Err(_)) => CallState::Failed,
            None => CallState::Invoked,
        }
    }

    pub(crate) async fn wait(&self, call_id: CallId) -> Result<(), CallError> {
        let mut rx = self.changed.subscribe();
        loop {
            if let Some(result) = self.result_of(call_id) {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CallError::JobFailed {
                    job_id: self.job_id.clone(),
                    reason: "completion board closed".to_string(),
                });
            }
        }
    }
}

//! Generation worker: runs one [`Generator::stream`] call on its own thread.
//!
//! The worker only ever writes to its [`FragmentSender`]. On failure it
//! forwards a single [`Fragment::Error`](crate::channel::Fragment::Error)
//! through the same channel, then the terminal marker, so the consumer sees
//! failures in order with normal text and never has its history touched from
//! this thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::FragmentSender;
use crate::generator::{GenerationRequest, Generator};

/// How a worker's generator call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed(String),
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct GenerationWorker {
    handle: JoinHandle<WorkerOutcome>,
}

impl GenerationWorker {
    /// Start the generator on the blocking pool.
    pub fn spawn(
        generator: Arc<dyn Generator>,
        request: GenerationRequest,
        sender: FragmentSender,
    ) -> Self {
        let handle =
            tokio::task::spawn_blocking(move || run(generator.as_ref(), &request, sender));
        Self { handle }
    }

    /// Wait for the worker thread to exit.
    pub async fn join(self) -> WorkerOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            // `run` catches generator panics; this is only reachable if the
            // runtime cancelled the task during shutdown.
            Err(e) => WorkerOutcome::Failed(format!("generation worker did not finish: {e}")),
        }
    }
}

fn run(
    generator: &dyn Generator,
    request: &GenerationRequest,
    sender: FragmentSender,
) -> WorkerOutcome {
    let mut emitted = 0usize;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        generator.stream(request, &mut |fragment| {
            emitted += 1;
            sender.send(fragment);
        })
    }));

    let outcome = match result {
        Ok(Ok(())) => WorkerOutcome::Completed,
        Ok(Err(e)) => WorkerOutcome::Failed(e.to_string()),
        Err(payload) => WorkerOutcome::Failed(panic_message(payload.as_ref())),
    };

    match &outcome {
        WorkerOutcome::Completed => debug!(emitted, "generator finished"),
        WorkerOutcome::Failed(message) => {
            warn!(emitted, error = %message, "generator failed");
            sender.fail(message.clone());
        }
    }

    sender.finish();
    outcome
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("generator panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("generator panicked: {s}")
    } else {
        "generator panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Fragment, fragment_channel};
    use parley_shared::{History, ParleyError, Result, Scope, UserId};

    struct Scripted(Vec<&'static str>, Option<&'static str>);

    impl Generator for Scripted {
        fn stream(&self, _: &GenerationRequest, emit: &mut dyn FnMut(String)) -> Result<()> {
            for fragment in &self.0 {
                emit((*fragment).to_string());
            }
            match self.1 {
                Some(message) => Err(ParleyError::generation(message)),
                None => Ok(()),
            }
        }
    }

    struct Panics;

    impl Generator for Panics {
        fn stream(&self, _: &GenerationRequest, _: &mut dyn FnMut(String)) -> Result<()> {
            panic!("boom");
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            history: History::new(),
            question: "q".into(),
            scope: Scope::for_user(&UserId::parse("w").unwrap()),
        }
    }

    async fn drain(generator: Arc<dyn Generator>) -> (Vec<Fragment>, WorkerOutcome) {
        let (tx, mut rx) = fragment_channel();
        let worker = GenerationWorker::spawn(generator, request(), tx);

        let mut fragments = Vec::new();
        loop {
            let fragment = rx.recv().await;
            let end = fragment == Fragment::End;
            fragments.push(fragment);
            if end {
                break;
            }
        }
        (fragments, worker.join().await)
    }

    #[tokio::test]
    async fn forwards_fragments_then_end() {
        let (fragments, outcome) = drain(Arc::new(Scripted(vec!["4", "!"], None))).await;
        assert_eq!(
            fragments,
            vec![
                Fragment::Text("4".into()),
                Fragment::Text("!".into()),
                Fragment::End
            ]
        );
        assert_eq!(outcome, WorkerOutcome::Completed);
    }

    #[tokio::test]
    async fn failure_becomes_error_fragment() {
        let (fragments, outcome) =
            drain(Arc::new(Scripted(vec!["par"], Some("rate limited")))).await;
        assert_eq!(
            fragments,
            vec![
                Fragment::Text("par".into()),
                Fragment::Error("rate limited".into()),
                Fragment::End
            ]
        );
        assert_eq!(outcome, WorkerOutcome::Failed("rate limited".into()));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (fragments, outcome) = drain(Arc::new(Panics)).await;
        assert_eq!(fragments.len(), 2);
        match &fragments[0] {
            Fragment::Error(message) => assert!(message.starts_with("generator panicked")),
            other => panic!("unexpected fragment {other:?}"),
        }
        assert_eq!(fragments[1], Fragment::End);
        assert!(matches!(outcome, WorkerOutcome::Failed(_)));
    }
}

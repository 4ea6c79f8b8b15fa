//! Ordered single-producer/single-consumer fragment handoff.
//!
//! The sending half lives on the generation worker thread and never blocks;
//! the receiving half is awaited by the stream assembler. The terminal
//! [`Fragment::End`] is sent exactly once: by [`FragmentSender::finish`], or
//! by `Drop` if the sender goes away without finishing (e.g. unwinding).

use tokio::sync::mpsc;

/// One item on the fragment channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A piece of answer text.
    Text(String),
    /// Generation failed with this message; the answer is void.
    Error(String),
    /// No more fragments for this turn.
    End,
}

/// Create a connected sender/receiver pair.
pub fn fragment_channel() -> (FragmentSender, FragmentReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FragmentSender { tx: Some(tx) },
        FragmentReceiver { rx, ended: false },
    )
}

/// Producer half. Sending never blocks.
#[derive(Debug)]
pub struct FragmentSender {
    tx: Option<mpsc::UnboundedSender<Fragment>>,
}

impl FragmentSender {
    /// Enqueue one text fragment. A vanished receiver is ignored.
    pub fn send(&self, text: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Fragment::Text(text));
        }
    }

    /// Enqueue a failure. The consumer records it in place of the answer.
    pub fn fail(&self, message: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Fragment::Error(message));
        }
    }

    /// Enqueue the terminal marker and close the channel.
    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Fragment::End);
        }
    }
}

impl Drop for FragmentSender {
    fn drop(&mut self) {
        self.end();
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct FragmentReceiver {
    rx: mpsc::UnboundedReceiver<Fragment>,
    ended: bool,
}

impl FragmentReceiver {
    /// Wait for the next fragment. After [`Fragment::End`] has been returned,
    /// every further call returns `End` immediately.
    pub async fn recv(&mut self) -> Fragment {
        if self.ended {
            return Fragment::End;
        }

        match self.rx.recv().await {
            Some(Fragment::Text(text)) => Fragment::Text(text),
            Some(Fragment::Error(message)) => Fragment::Error(message),
            Some(Fragment::End) | None => {
                self.ended = true;
                self.rx.close();
                Fragment::End
            }
        }
    }
}

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{domain::UserId, protocol::ClientRequest};
use tokio::{sync::mpsc, task::JoinHandle};

pub const TYPING_IDLE: Duration = Duration::from_secs(1);

/// Turns local input changes into `typing-start` / `typing-stop` requests.
/// One idle timer is live at a time and every keystroke restarts it.
pub struct TypingNotifier {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    idle: Duration,
    typing: Arc<AtomicBool>,
    receiver: Option<UserId>,
    timer: Option<JoinHandle<()>>,
}

impl TypingNotifier {
    pub fn new(outbound: mpsc::UnboundedSender<ClientRequest>) -> Self {
        Self::with_idle(outbound, TYPING_IDLE)
    }

    pub fn with_idle(outbound: mpsc::UnboundedSender<ClientRequest>, idle: Duration) -> Self {
        Self {
            outbound,
            idle,
            typing: Arc::new(AtomicBool::new(false)),
            receiver: None,
            timer: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing.load(Ordering::SeqCst)
    }

    pub fn input_changed(&mut self, receiver_id: UserId, input: &str) {
        if self.receiver.is_some_and(|current| current != receiver_id) {
            self.stop();
        }
        self.receiver = Some(receiver_id);

        if input.is_empty() {
            self.stop();
            return;
        }

        if !self.typing.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(ClientRequest::TypingStart { receiver_id });
        }
        self.restart_timer(receiver_id);
    }

    /// Emits `typing-stop` now if a start is outstanding.
    pub fn stop(&mut self) {
        self.cancel_timer();
        if let Some(receiver_id) = self.receiver {
            if self.typing.swap(false, Ordering::SeqCst) {
                let _ = self.outbound.send(ClientRequest::TypingStop { receiver_id });
            }
        }
    }

    fn restart_timer(&mut self, receiver_id: UserId) {
        self.cancel_timer();
        let typing = Arc::clone(&self.typing);
        let outbound = self.outbound.clone();
        let idle = self.idle;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if typing.swap(false, Ordering::SeqCst) {
                let _ = outbound.send(ClientRequest::TypingStop { receiver_id });
            }
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;

// The processing-unit contract shared by the job and post units: a
// bounded input queue with overload/deny backpressure and a lifecycle
// state reported to the unit maintainer.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use async_trait::async_trait;
use forge_common::error::ResourceError;
use forge_common::letter::Letter;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelEntry;

/// Input queue capacity of a unit.
pub const UNIT_QUEUE_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not yet started, or stopped.
    Stop,
    Ready,
    /// Above the high-watermark; letters are still accepted.
    Overload,
    /// Queue full; the caller must not retry.
    Deny,
    /// Stopped by an unexpected error.
    Excep,
    /// Workspace not clean; no new work until recovered.
    Dirty,
}

impl UnitState {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Stop => "STOP",
            UnitState::Ready => "READY",
            UnitState::Overload => "OVERLOAD",
            UnitState::Deny => "DENY",
            UnitState::Excep => "EXCEP",
            UnitState::Dirty => "DIRTY",
        }
    }
}

/// Queue, state and channel plumbing embedded by every concrete unit.
pub struct UnitCore {
    ident: String,
    state: Mutex<UnitState>,
    queue: Mutex<VecDeque<Letter>>,
    cap: usize,
    high_watermark: usize,
    available: Notify,
    channel: ChannelEntry,
}

impl UnitCore {
    pub fn new(ident: impl Into<String>, channel: ChannelEntry) -> Self {
        Self::with_capacity(ident, channel, UNIT_QUEUE_CAP)
    }

    pub fn with_capacity(
        ident: impl Into<String>,
        channel: ChannelEntry,
        cap: usize,
    ) -> Self {
        Self {
            ident: ident.into(),
            state: Mutex::new(UnitState::Stop),
            queue: Mutex::new(VecDeque::new()),
            cap,
            high_watermark: cap * 2 / 3,
            available: Notify::new(),
            channel,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: UnitState) {
        *self.state.lock().unwrap() = state;
        self.channel.update("state", state.as_str());
    }

    /// Set the state and push a report to the maintainer.
    pub async fn set_state_notify(&self, state: UnitState) {
        self.set_state(state);
        self.channel.publish(state).await;
    }

    pub fn channel(&self) -> &ChannelEntry {
        &self.channel
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Enqueue one letter.
    ///
    /// A full queue denies the letter. Crossing the high-watermark still
    /// accepts it but raises OVERLOAD so the caller can back off. Both
    /// conditions are published to the maintainer.
    pub async fn proc(&self, letter: Letter) -> Result<(), ResourceError> {
        let over = {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.cap {
                None
            } else {
                queue.push_back(letter);
                Some(queue.len() > self.high_watermark)
            }
        };

        match over {
            None => {
                self.set_state_notify(UnitState::Deny).await;
                Err(ResourceError::QueueDeny(self.ident.clone()))
            }
            Some(true) => {
                self.available.notify_one();
                self.set_state_notify(UnitState::Overload).await;
                Err(ResourceError::QueueOverload(self.ident.clone()))
            }
            Some(false) => {
                self.available.notify_one();
                Ok(())
            }
        }
    }

    /// Wait for the next queued letter. Draining back under the
    /// high-watermark recovers an overloaded or denying unit to READY.
    pub async fn retrieve(&self) -> Letter {
        loop {
            let popped = {
                let mut queue = self.queue.lock().unwrap();
                queue.pop_front()
            };

            if let Some(letter) = popped {
                let recovered = {
                    let len = self.queue_len();
                    len <= self.high_watermark
                        && matches!(self.state(), UnitState::Overload | UnitState::Deny)
                };
                if recovered {
                    self.set_state_notify(UnitState::Ready).await;
                }
                return letter;
            }

            self.available.notified().await;
        }
    }

    pub fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn remove_where(&self, predicate: impl Fn(&Letter) -> bool) {
        self.queue.lock().unwrap().retain(|l| !predicate(l));
    }

    pub fn find_in_queue(&self, predicate: impl Fn(&Letter) -> bool) -> bool {
        self.queue.lock().unwrap().iter().any(predicate)
    }
}

/// One worker-local processing unit.
#[async_trait]
pub trait ProcUnit: Send + Sync {
    fn core(&self) -> &UnitCore;

    /// The unit's main loop; runs until cancelled.
    async fn run(self: std::sync::Arc<Self>, cancel: CancellationToken);

    /// Restore a clean workspace. True on success.
    async fn cleanup(&self) -> bool;

    /// Cancel one task, whether queued or in flight.
    async fn cancel(&self, tid: &str);

    /// Discard all local state (queued letters and running work).
    async fn reset(&self);

    fn ident(&self) -> &str {
        self.core().ident()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use forge_common::letter::{HeartbeatLetter, Letter};

    fn letter(seq: u64) -> Letter {
        Letter::Heartbeat(HeartbeatLetter::new("x", seq))
    }

    #[tokio::test]
    async fn test_overload_past_high_watermark_still_accepts() {
        let mut channel = Channel::new(64);
        let mut rx = channel.take_receiver();
        let core = UnitCore::with_capacity("u", channel.entry("u"), 9);
        core.set_state(UnitState::Ready);

        for i in 0..6 {
            core.proc(letter(i)).await.unwrap();
        }
        // Seventh letter crosses 2/3 of 9.
        match core.proc(letter(6)).await {
            Err(ResourceError::QueueOverload(_)) => {}
            other => panic!("expected overload, got {other:?}"),
        }
        assert_eq!(core.queue_len(), 7);
        assert_eq!(rx.recv().await.unwrap().state, UnitState::Overload);
    }

    #[tokio::test]
    async fn test_full_queue_denies() {
        let mut channel = Channel::new(64);
        let mut rx = channel.take_receiver();
        let core = UnitCore::with_capacity("u", channel.entry("u"), 3);
        core.set_state(UnitState::Ready);

        for i in 0..3 {
            let _ = core.proc(letter(i)).await;
        }
        match core.proc(letter(3)).await {
            Err(ResourceError::QueueDeny(_)) => {}
            other => panic!("expected deny, got {other:?}"),
        }
        assert_eq!(core.queue_len(), 3);
        assert_eq!(core.state(), UnitState::Deny);

        // Channel saw the overload reports, then the deny.
        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report.state);
        }
        assert_eq!(last, Some(UnitState::Deny));
    }

    #[tokio::test]
    async fn test_deny_backpressure_at_default_capacity() {
        let mut channel = Channel::new(8);
        let _rx = channel.take_receiver();
        let core = UnitCore::new("u", channel.entry("u"));
        core.set_state(UnitState::Ready);

        for i in 0..UNIT_QUEUE_CAP as u64 {
            let _ = core.proc(letter(i)).await;
        }
        assert!(matches!(
            core.proc(letter(9999)).await,
            Err(ResourceError::QueueDeny(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_recovers_to_ready() {
        let mut channel = Channel::new(64);
        let _rx = channel.take_receiver();
        let core = UnitCore::with_capacity("u", channel.entry("u"), 3);
        core.set_state(UnitState::Ready);

        for i in 0..3 {
            let _ = core.proc(letter(i)).await;
        }
        assert_eq!(core.state(), UnitState::Deny);

        let _ = core.retrieve().await;
        assert_eq!(core.state(), UnitState::Ready);
    }

    #[tokio::test]
    async fn test_retrieve_waits_for_enqueue() {
        let mut channel = Channel::new(8);
        let _rx = channel.take_receiver();
        let core = std::sync::Arc::new(UnitCore::with_capacity("u", channel.entry("u"), 8));
        core.set_state(UnitState::Ready);

        let waiter = core.clone();
        let handle = tokio::spawn(async move { waiter.retrieve().await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        core.proc(letter(1)).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, letter(1));
    }
}

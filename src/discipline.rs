//! Link access discipline: one exchange in flight, commands before polls.
//!
//! The discipline owns the FIFO of explicit commands and the single
//! [`PendingExchange`]. It never touches the link itself; the engine asks it
//! what to send next, writes the bytes, and reports back what arrived. Time is
//! passed in so the state machine can be driven by tests without a runtime.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::LinkError;
use crate::scheduler::RequestScheduler;
use crate::value::Value;

/// Completion side of a caller's future.
pub type Responder = oneshot::Sender<Result<Value, LinkError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Free to send.
    Idle,
    /// One exchange outstanding.
    Awaiting,
}

/// An explicit command waiting for the link.
#[derive(Debug)]
pub struct Outbound {
    pub key: String,
    pub payload: Vec<u8>,
    pub expect_reply: bool,
    /// Only this response rule (or a status rule) may settle the exchange.
    pub expected_response: Option<String>,
    pub responder: Option<Responder>,
}

impl Outbound {
    #[must_use]
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            expect_reply: true,
            expected_response: None,
            responder: None,
        }
    }
    #[must_use]
    pub fn with_expected_response(mut self, key: Option<String>) -> Self {
        self.expected_response = key;
        self
    }
    #[must_use]
    pub const fn with_expect_reply(mut self, expect_reply: bool) -> Self {
        self.expect_reply = expect_reply;
        self
    }
    #[must_use]
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }
}

#[derive(Debug)]
pub struct PendingExchange {
    pub request_key: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub expected_response: Option<String>,
    /// Bytes that were sent, kept for error dumps.
    pub payload: Vec<u8>,
    responder: Option<Responder>,
}

impl PendingExchange {
    /// Polls have no caller waiting on them.
    #[must_use]
    pub const fn is_command(&self) -> bool {
        self.responder.is_some()
    }
}

/// Bytes the engine must write now.
#[derive(Debug)]
pub struct Transmit {
    pub key: String,
    pub payload: Vec<u8>,
    pub is_poll: bool,
    /// Set for fire-and-forget commands: resolve it once the write succeeded.
    pub on_written: Option<Responder>,
}

/// Report of an exchange that ran out of time.
#[derive(Debug)]
pub struct Expired {
    pub key: String,
    pub payload: Vec<u8>,
    pub was_command: bool,
}

#[derive(Debug)]
pub struct LinkDiscipline {
    timeout: Duration,
    commands: VecDeque<Outbound>,
    pending: Option<PendingExchange>,
}

impl LinkDiscipline {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            commands: VecDeque::new(),
            pending: None,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        if self.pending.is_some() {
            LinkState::Awaiting
        } else {
            LinkState::Idle
        }
    }

    #[must_use]
    pub const fn pending(&self) -> Option<&PendingExchange> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.commands.len()
    }

    /// Queue an explicit command. Never rejected, whatever the link state.
    pub fn enqueue(&mut self, outbound: Outbound) {
        self.commands.push_back(outbound);
    }

    /// If the link is idle, choose what to send: the oldest queued command,
    /// else the next scheduled poll. Transitions to `Awaiting` when the chosen
    /// request expects a reply.
    pub fn next_transmit(
        &mut self,
        scheduler: &mut RequestScheduler,
        now: Instant,
    ) -> Option<Transmit> {
        if self.pending.is_some() {
            return None;
        }
        let (outbound, is_poll) = match self.commands.pop_front() {
            Some(cmd) => (cmd, false),
            None => {
                let poll = scheduler.next_request()?;
                let out = Outbound::new(poll.key.clone(), poll.payload.clone())
                    .with_expected_response(poll.expected_response.clone());
                (out, true)
            }
        };
        let Outbound {
            key,
            payload,
            expect_reply,
            expected_response,
            responder,
        } = outbound;

        if !expect_reply {
            return Some(Transmit {
                key,
                payload,
                is_poll,
                on_written: responder,
            });
        }
        self.pending = Some(PendingExchange {
            request_key: key.clone(),
            issued_at: now,
            deadline: now + self.timeout,
            expected_response,
            payload: payload.clone(),
            responder,
        });
        Some(Transmit {
            key,
            payload,
            is_poll,
            on_written: None,
        })
    }

    /// Settle the outstanding exchange and free the link. Returns the key of the
    /// settled request, or `None` if nothing was outstanding.
    pub fn settle(&mut self, result: Result<Value, LinkError>) -> Option<String> {
        let mut pending = self.pending.take()?;
        if let Some(responder) = pending.responder.take() {
            // the caller may have stopped waiting; that is not our failure
            let _ = responder.send(result);
        }
        Some(pending.request_key)
    }

    /// Reject the outstanding exchange with a timeout once its deadline has
    /// passed. The link is freed either way; a late answer is then unsolicited.
    pub fn expire(&mut self, now: Instant) -> Option<Expired> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let mut pending = self.pending.take()?;
        let was_command = pending.is_command();
        if let Some(responder) = pending.responder.take() {
            let _ = responder.send(Err(LinkError::Timeout {
                key: pending.request_key.clone(),
            }));
        }
        Some(Expired {
            key: pending.request_key,
            payload: pending.payload,
            was_command,
        })
    }

    /// Fail every queued command, used when the link goes away.
    pub fn abort_all(&mut self) {
        let _ = self.settle(Err(LinkError::Closed));
        for mut cmd in self.commands.drain(..) {
            if let Some(responder) = cmd.responder.take() {
                let _ = responder.send(Err(LinkError::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PollRequest;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn scheduler() -> RequestScheduler {
        RequestScheduler::new(vec![
            PollRequest::new("input", b"I\r\n".to_vec(), 0.5).expect("poll"),
        ])
        .expect("schedule")
    }

    #[test]
    fn idle_sends_poll_and_awaits() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = scheduler();
        let now = Instant::now();
        let t = d.next_transmit(&mut s, now).expect("poll sent");
        assert!(t.is_poll);
        assert_eq!(t.payload, b"I\r\n");
        assert_eq!(d.state(), LinkState::Awaiting);
        assert_eq!(d.deadline(), Some(now + TIMEOUT));
        assert!(d.next_transmit(&mut s, now).is_none(), "one exchange in flight");
    }

    #[test]
    fn commands_preempt_polls_in_fifo_order() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = scheduler();
        d.enqueue(Outbound::new("set_input", b"1!\r\n".to_vec()));
        d.enqueue(Outbound::new("set_mute", b"1Z\r\n".to_vec()));
        let now = Instant::now();

        let first = d.next_transmit(&mut s, now).expect("send");
        assert_eq!(first.key, "set_input");
        assert!(!first.is_poll);
        assert_eq!(d.queued(), 1);
        d.settle(Ok(Value::Null));

        let second = d.next_transmit(&mut s, now).expect("send");
        assert_eq!(second.key, "set_mute");
        d.settle(Ok(Value::Null));

        let third = d.next_transmit(&mut s, now).expect("send");
        assert!(third.is_poll);
    }

    #[test]
    fn settle_resolves_caller_once() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = RequestScheduler::default();
        let (tx, mut rx) = oneshot::channel();
        d.enqueue(Outbound::new("set_input", b"2!\r\n".to_vec()).with_responder(tx));
        d.next_transmit(&mut s, Instant::now()).expect("send");

        assert_eq!(d.settle(Ok(Value::from("2"))).as_deref(), Some("set_input"));
        assert_eq!(d.state(), LinkState::Idle);
        assert!(d.settle(Ok(Value::Null)).is_none());
        let got = rx.try_recv().expect("resolved").expect("ok");
        assert_eq!(got, Value::from("2"));
    }

    #[test]
    fn deadline_rejects_with_timeout_and_frees_link() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = scheduler();
        let (tx, mut rx) = oneshot::channel();
        d.enqueue(Outbound::new("set_input", b"3!\r\n".to_vec()).with_responder(tx));
        let t0 = Instant::now();
        d.next_transmit(&mut s, t0).expect("send");

        assert!(d.expire(t0 + Duration::from_millis(499)).is_none());
        assert_eq!(d.state(), LinkState::Awaiting);

        let expired = d.expire(t0 + TIMEOUT).expect("expired");
        assert!(expired.was_command);
        assert_eq!(d.state(), LinkState::Idle);
        assert!(matches!(rx.try_recv(), Ok(Err(LinkError::Timeout { .. }))));

        let next = d.next_transmit(&mut s, t0 + TIMEOUT).expect("poll after timeout");
        assert!(next.is_poll);
    }

    #[test]
    fn fire_and_forget_does_not_hold_the_link() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = RequestScheduler::default();
        let (tx, _rx) = oneshot::channel();
        d.enqueue(
            Outbound::new("reset", b"ESC ZXXX\r\n".to_vec())
                .with_expect_reply(false)
                .with_responder(tx),
        );
        let t = d.next_transmit(&mut s, Instant::now()).expect("send");
        assert!(t.on_written.is_some());
        assert_eq!(d.state(), LinkState::Idle);
    }

    #[test]
    fn abort_fails_everything() {
        let mut d = LinkDiscipline::new(TIMEOUT);
        let mut s = RequestScheduler::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        d.enqueue(Outbound::new("a", vec![1]).with_responder(tx1));
        d.enqueue(Outbound::new("b", vec![2]).with_responder(tx2));
        d.next_transmit(&mut s, Instant::now()).expect("send");
        d.abort_all();
        assert!(matches!(rx1.try_recv(), Ok(Err(LinkError::Closed))));
        assert!(matches!(rx2.try_recv(), Ok(Err(LinkError::Closed))));
        assert_eq!(d.queued(), 0);
    }
}

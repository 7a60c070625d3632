//! A2 collaborator interface: the outgoing-mail sink (SPEC_FULL.md §4.10,
//! §5 background dispatcher). Email composition and real SMTP delivery
//! stay out of scope (spec.md §1) — `SmtpMailSink` only logs.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait MailSink: Send + Sync {
    fn send(&self, msg: OutgoingMail);
}

/// In-memory ring buffer, inspectable by tests and by the `catch` mode
/// the CLI advertises for local development.
pub struct CatchMailSink {
    inbox: Mutex<VecDeque<OutgoingMail>>,
    capacity: usize,
}

impl CatchMailSink {
    pub fn new(capacity: usize) -> Self {
        Self { inbox: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    pub fn drain(&self) -> Vec<OutgoingMail> {
        self.inbox.lock().expect("mail inbox mutex poisoned").drain(..).collect()
    }
}

impl MailSink for CatchMailSink {
    fn send(&self, msg: OutgoingMail) {
        let mut inbox = self.inbox.lock().expect("mail inbox mutex poisoned");
        if inbox.len() >= self.capacity {
            inbox.pop_front();
        }
        inbox.push_back(msg);
    }
}

/// Declared per SPEC_FULL.md §4.10 but real delivery is out of scope;
/// logs the message through `tracing` and drops it.
pub struct SmtpMailSink {
    pub host: String,
    pub port: u16,
}

impl MailSink for SmtpMailSink {
    fn send(&self, msg: OutgoingMail) {
        tracing::info!(host = %self.host, port = self.port, to = %msg.to, subject = %msg.subject, "smtp delivery not implemented; dropping message");
    }
}

/// The single background mail worker (SPEC_FULL.md §5): every request
/// handler enqueues onto an unbounded `mpsc` channel and returns
/// immediately, while one `tokio::spawn`'d task drains it serially and
/// forwards each message to the configured `MailSink`. Keeps delivery
/// off the request path the same way the HTTP/wire listeners keep
/// connection handling off each other.
pub struct MailDispatcher {
    tx: UnboundedSender<OutgoingMail>,
}

impl MailDispatcher {
    pub fn spawn(sink: Box<dyn MailSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingMail>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                sink.send(msg);
            }
        });
        Self { tx }
    }

    /// Enqueues `msg` for background delivery. Never blocks; a closed
    /// receiver (worker task gone) is silently swallowed rather than
    /// panicking the caller, since a dropped mail notification should
    /// never fail the request that triggered it.
    pub fn send(&self, msg: OutgoingMail) {
        let _ = self.tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_sink_retains_messages_up_to_capacity() {
        let sink = CatchMailSink::new(2);
        sink.send(OutgoingMail { to: "a@example.com".to_string(), subject: "1".to_string(), body: "".to_string() });
        sink.send(OutgoingMail { to: "b@example.com".to_string(), subject: "2".to_string(), body: "".to_string() });
        sink.send(OutgoingMail { to: "c@example.com".to_string(), subject: "3".to_string(), body: "".to_string() });
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].subject, "2");
    }

    struct RecordingSink(std::sync::Arc<Mutex<Vec<OutgoingMail>>>);

    impl MailSink for RecordingSink {
        fn send(&self, msg: OutgoingMail) {
            self.0.lock().expect("recording sink mutex poisoned").push(msg);
        }
    }

    #[tokio::test]
    async fn dispatcher_forwards_enqueued_mail_to_the_background_sink() {
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let dispatcher = MailDispatcher::spawn(Box::new(RecordingSink(received.clone())));
        dispatcher.send(OutgoingMail { to: "a@example.com".to_string(), subject: "hi".to_string(), body: "".to_string() });

        for _ in 0..100 {
            if !received.lock().expect("recording sink mutex poisoned").is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let got = received.lock().expect("recording sink mutex poisoned");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].to, "a@example.com");
    }
}

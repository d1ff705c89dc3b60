//! Mock datagram transport for testing the UDP connection handler
//!
//! Provides a [`MockUdpTransport`] that answers AniDB UDP commands from a
//! script instead of a socket. Replies are chosen per command name:
//!
//! 1. one-shot replies queued with [`MockUdpTransport::reply_once`], in order
//! 2. a standing reply set with [`MockUdpTransport::reply_always`]
//! 3. built-in defaults: AUTH logs in with a fresh session key, PING answers
//!    PONG, LOGOUT succeeds, anything else is an unknown command
//!
//! # Lock Poisoning Recovery
//!
//! Locks are acquired with `unwrap_or_else(|e| e.into_inner())` so one
//! panicking test cannot poison the mock for the rest of the suite.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tsundoku_anidb_client::UdpTransport;

/// What the mock does in response to one datagram
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this text
    Text(String),
    /// Answer with raw bytes (e.g. an all-zero ban datagram)
    Raw(Vec<u8>),
    /// Fail the exchange with an I/O error
    IoError(io::ErrorKind),
    /// Never answer; the caller's timeout fires
    Silence,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Empty datagram of the given length
    pub fn zeros(len: usize) -> Self {
        Self::Raw(vec![0; len])
    }
}

/// A datagram the handler sent
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub at: Instant,
    pub text: String,
}

impl SentDatagram {
    /// Command name, e.g. `AUTH`
    pub fn command(&self) -> &str {
        self.text.split(' ').next().unwrap_or_default()
    }

    /// Value of a `key=value` parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        let (_, params) = self.text.split_once(' ')?;
        params
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[derive(Default)]
struct MockState {
    once: HashMap<String, VecDeque<MockReply>>,
    always: HashMap<String, MockReply>,
    sent: Vec<SentDatagram>,
    sessions_issued: usize,
    reconnects: usize,
}

/// Scripted [`UdpTransport`] for tests
///
/// # Example
///
/// ```rust
/// use tsundoku_test_utils::{MockReply, MockUdpTransport};
///
/// let transport = MockUdpTransport::new();
/// transport.reply_once("FILE", MockReply::text("320 NO SUCH FILE"));
/// assert_eq!(transport.exchange_count(), 0);
/// ```
#[derive(Default)]
pub struct MockUdpTransport {
    state: Mutex<MockState>,
    latency: Mutex<Option<Duration>>,
}

impl MockUdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `command` with `reply`
    pub fn reply_once(&self, command: &str, reply: MockReply) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Answer every `command` with `reply` once one-shot replies run out
    pub fn reply_always(&self, command: &str, reply: MockReply) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.always.insert(command.to_string(), reply);
    }

    /// Delay every reply by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    /// Every datagram sent so far, oldest first
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sent
            .clone()
    }

    /// Datagrams sent for one command name
    pub fn sent_for(&self, command: &str) -> Vec<SentDatagram> {
        self.sent()
            .into_iter()
            .filter(|d| d.command() == command)
            .collect()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sent.len()
    }

    pub fn reconnect_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).reconnects
    }

    /// Session keys handed out by the default AUTH reply are `sess1`, `sess2`, ...
    pub fn sessions_issued(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions_issued
    }

    fn next_reply(&self, text: &str) -> MockReply {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sent.push(SentDatagram {
            at: Instant::now(),
            text: text.to_string(),
        });

        let command = text.split(' ').next().unwrap_or_default().to_string();
        if let Some(reply) = state.once.get_mut(&command).and_then(VecDeque::pop_front) {
            return reply;
        }
        if let Some(reply) = state.always.get(&command) {
            return reply.clone();
        }

        match command.as_str() {
            "AUTH" => {
                state.sessions_issued += 1;
                MockReply::Text(format!(
                    "200 sess{} 127.0.0.1:4556 LOGIN ACCEPTED",
                    state.sessions_issued
                ))
            }
            "PING" => MockReply::text("300 PONG"),
            "LOGOUT" => MockReply::text("203 LOGGED OUT"),
            _ => MockReply::text("598 UNKNOWN COMMAND"),
        }
    }
}

#[async_trait]
impl UdpTransport for MockUdpTransport {
    async fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let text = String::from_utf8_lossy(request).into_owned();
        let reply = self.next_reply(&text);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            MockReply::Text(text) => Ok(text.into_bytes()),
            MockReply::Raw(bytes) => Ok(bytes),
            MockReply::IoError(kind) => Err(io::Error::new(kind, "mock transport failure")),
            MockReply::Silence => std::future::pending().await,
        }
    }

    async fn reconnect(&self) -> io::Result<()> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reconnects += 1;
        Ok(())
    }
}

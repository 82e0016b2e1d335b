//! Transport contract between the control core and the instrument link.
//!
//! The core never talks to a serial port directly; it depends on the narrow
//! [`InstrumentTransport`] trait so the same controller logic runs against
//! the real serial adapter ([`crate::serial::SerialTransport`]) and against
//! the scripted [`MockTransport`] in tests.
//!
//! The contract is deliberately query-only. The CryoCon protocol has no
//! request identifiers: one unmatched command/response pair desynchronizes
//! every subsequent read for the session. Implementations must therefore
//! guarantee exactly one response line per `query` call and must not
//! interleave round-trips across concurrent callers (both implementations
//! here hold an internal lock for the full write+read).

use crate::error::{CryoconError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Abstraction over the instrument link so the core can be exercised
/// without hardware.
///
/// Every interaction with the instrument, including writes, goes through
/// [`query`](InstrumentTransport::query): the instrument answers every line
/// it receives, and consuming that answer keeps command and response in
/// lock-step. The round-trip is bounded by the timeout fixed at transport
/// construction; on expiry the implementation returns
/// [`CryoconError::CommunicationTimeout`] and performs no retry.
#[async_trait]
pub trait InstrumentTransport: Send + Sync {
    /// Open the connection. Fails with [`CryoconError::Connection`].
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently open.
    async fn is_connected(&self) -> bool;

    /// Send one command line and await exactly one response line, trimmed
    /// of the terminator and surrounding whitespace.
    async fn query(&self, command: &str) -> Result<String>;
}

// =============================================================================
// MockTransport
// =============================================================================

struct MockState {
    connected: bool,
    commands: Vec<String>,
    responses: VecDeque<Result<String>>,
}

/// Scripted in-memory transport for tests.
///
/// Responses are queued ahead of time with [`push_response`](MockTransport::push_response)
/// and [`push_error`](MockTransport::push_error) and consumed in order, one
/// per query; every command sent is recorded and can be inspected with
/// [`commands`](MockTransport::commands). Cloning shares the underlying
/// state, so a test can keep a handle for scripting while the controller
/// owns another.
///
/// ```no_run
/// # async fn demo() {
/// use cryocon_22c::transport::{InstrumentTransport, MockTransport};
///
/// let mock = MockTransport::new();
/// mock.push_response("ON").await;
/// mock.connect().await.unwrap();
/// assert_eq!(mock.query("control?").await.unwrap(), "ON");
/// assert_eq!(mock.commands().await, vec!["control?".to_string()]);
/// # }
/// ```
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a disconnected mock with an empty response queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: false,
                commands: Vec::new(),
                responses: VecDeque::new(),
            })),
        }
    }

    /// Queue a successful response line.
    pub async fn push_response<S: Into<String>>(&self, response: S) {
        self.state
            .lock()
            .await
            .responses
            .push_back(Ok(response.into()));
    }

    /// Queue an error to be returned for one query.
    pub async fn push_error(&self, error: CryoconError) {
        self.state.lock().await.responses.push_back(Err(error));
    }

    /// Commands sent so far, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Drop the recorded command log (the response queue is untouched).
    ///
    /// Useful after scripted discovery, so assertions only see the commands
    /// of the operation under test.
    pub async fn clear_commands(&self) {
        self.state.lock().await.commands.clear();
    }

    /// Number of responses still queued.
    pub async fn remaining_responses(&self) -> usize {
        self.state.lock().await.responses.len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl InstrumentTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.state.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(CryoconError::NotConnected);
        }

        state.commands.push(command.to_string());
        state.responses.pop_front().unwrap_or_else(|| {
            Err(CryoconError::Protocol(format!(
                "no mock response queued for '{command}'"
            )))
        })
    }
}

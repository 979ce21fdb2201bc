//! Scripted transport for protocol tests.
//!
//! Replies are queued up front and handed out in order, one per `read_line`.
//! Every written command is recorded. Clones share the same script and log, so
//! a test can keep one handle after moving the other into a controller.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Transport;
use crate::error::{KeithleyError, Result};

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<String>,
    commands: Vec<String>,
    closed: bool,
}

/// Transport that replays queued replies and logs every command.
#[derive(Debug, Clone)]
pub struct MockTransport {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock with an empty reply queue.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Create a mock preloaded with `replies`.
    pub fn with_replies<I, S>(resource: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = MockState {
            replies: replies.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        Self {
            resource: resource.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue one more reply.
    pub async fn push_reply(&self, reply: impl Into<String>) {
        self.state.lock().await.replies.push_back(reply.into());
    }

    /// Commands written so far, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Forget the recorded commands.
    pub async fn clear_commands(&self) {
        self.state.lock().await.commands.clear();
    }

    /// Replies not yet consumed.
    pub async fn pending_replies(&self) -> usize {
        self.state.lock().await.replies.len()
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(KeithleyError::NotConnected);
        }
        tracing::debug!("Mock TSP write: {}", command);
        state.commands.push(command.to_string());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(KeithleyError::NotConnected);
        }
        match state.replies.pop_front() {
            Some(reply) => {
                tracing::debug!("Mock TSP reply: {}", reply);
                Ok(reply)
            }
            // An exhausted script behaves like a silent instrument
            None => Err(KeithleyError::Timeout(
                state.commands.last().cloned().unwrap_or_default(),
            )),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

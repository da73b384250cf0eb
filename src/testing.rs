//! Fakes for the transport and chat seams, shared by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::platform::ChatSink;
use crate::protocol::{encode, PolychatMessage};
use crate::transport::{ConnectionId, Frame, Transport};

pub fn frame<M: PolychatMessage>(connection: ConnectionId, message: &M) -> Frame {
    Frame {
        connection,
        bytes: encode(message).unwrap(),
    }
}

/// Records every post and role grant; clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingChat {
    posts: Arc<Mutex<Vec<(u64, String)>>>,
    roles: Arc<Mutex<Vec<(u64, u64)>>>,
    fail: bool,
}

impl RecordingChat {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn posts(&self) -> Vec<(u64, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.posts().into_iter().map(|(_, text)| text).collect()
    }

    /// `(member, role)` pairs in the order they were granted
    pub fn roles(&self) -> Vec<(u64, u64)> {
        self.roles.lock().unwrap().clone()
    }
}

impl ChatSink for RecordingChat {
    fn post(&self, channel_id: u64, text: &str) -> Result<()> {
        if self.fail {
            anyhow::bail!("chat unavailable");
        }
        self.posts
            .lock()
            .unwrap()
            .push((channel_id, text.to_string()));
        Ok(())
    }

    fn add_role(&self, member_id: u64, role_id: u64) -> Result<()> {
        if self.fail {
            anyhow::bail!("chat unavailable");
        }
        self.roles.lock().unwrap().push((member_id, role_id));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub except: Option<ConnectionId>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct FakeTransportState {
    batches: VecDeque<std::result::Result<Vec<Frame>, String>>,
    sent: Vec<Sent>,
}

/// Scripted poll results plus a log of everything sent; clones share state.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeTransport {
    pub fn queue_batch(&self, frames: Vec<Frame>) {
        self.state.lock().unwrap().batches.push_back(Ok(frames));
    }

    pub fn queue_failure(&self, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .batches
            .push_back(Err(reason.to_string()));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl Transport for FakeTransport {
    fn poll(&mut self) -> Result<Vec<Frame>> {
        match self.state.lock().unwrap().batches.pop_front() {
            Some(Ok(frames)) => Ok(frames),
            Some(Err(reason)) => anyhow::bail!(reason),
            None => Ok(Vec::new()),
        }
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        self.state.lock().unwrap().sent.push(Sent {
            except: None,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn broadcast_except(&mut self, origin: ConnectionId, bytes: &[u8]) -> Result<()> {
        self.state.lock().unwrap().sent.push(Sent {
            except: Some(origin),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

//! Process-group control channel.
//!
//! A [`ProcessController`] connects the processes (ranks) of one process
//! group. Rank 0 is the root; the others are satellites. The controller is
//! the only path ranks use to talk to each other, so tests can replace it
//! with an instrumented one.

mod dummy;
mod thread_group;

pub use dummy::DummyController;
pub use thread_group::ThreadGroupController;

use crate::error::Error;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, warn};

/// Message tags used on a controller.
pub mod tags {
    /// Remote method invocation; payload starts with the RMI id.
    pub const RMI: u32 = 1;
    /// Payload of a [`broadcast`](super::ProcessController::broadcast).
    pub const BROADCAST: u32 = 2;
    /// Partial result travelling up the gather tree.
    pub const COLLECT: u32 = 3;
    /// Progress report travelling to the root.
    pub const PROGRESS: u32 = 4;
}

/// Remote method ids carried in [`tags::RMI`] messages.
pub mod rmi {
    /// Execute the command stream in the payload.
    pub const STREAM: u32 = 1;
    /// Gather information into the tree.
    pub const GATHER: u32 = 2;
    pub const LOAD_MODULE: u32 = 3;
    /// Leave the RMI loop.
    pub const BREAK: u32 = 4;
}

/// A message received from another rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: i32,
    pub tag: u32,
    pub payload: Vec<u8>,
}

/// Selects messages by source and tag. `source: None` matches any source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    pub source: Option<i32>,
    pub tag: u32,
}

impl Matcher {
    pub fn exact(source: i32, tag: u32) -> Self {
        Self {
            source: Some(source),
            tag,
        }
    }

    pub fn any_source(tag: u32) -> Self {
        Self { source: None, tag }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope.tag == self.tag && self.source.map_or(true, |s| s == envelope.source)
    }
}

/// Control channel between the ranks of a process group.
///
/// Messages between one pair of ranks with the same tag are delivered in
/// order. Receives block until a matching message arrives; messages that
/// don't match stay queued for later receives.
pub trait ProcessController: Debug {
    fn local_process_id(&self) -> i32;

    fn number_of_processes(&self) -> i32;

    fn initialize(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn finalize(&mut self) {}

    fn send(&mut self, destination: i32, tag: u32, data: &[u8]) -> Result<(), Error>;

    /// Blocks until a message matching any of `matchers` arrives and returns
    /// the index of the matcher together with the message. Among queued
    /// messages the earliest arrival wins.
    fn wait_any(
        &mut self,
        matchers: &[Matcher],
        timeout: Option<Duration>,
    ) -> Result<(usize, Envelope), Error>;

    /// Non-blocking receive.
    fn try_receive(&mut self, matcher: Matcher) -> Result<Option<Envelope>, Error>;

    fn receive(&mut self, source: i32, tag: u32) -> Result<Vec<u8>, Error> {
        let (_, envelope) = self.wait_any(&[Matcher::exact(source, tag)], None)?;
        Ok(envelope.payload)
    }

    /// Root sends `data` to every other rank; the others replace `data` with
    /// what the root sent.
    fn broadcast(&mut self, data: &mut Vec<u8>, root: i32) -> Result<(), Error> {
        let me = self.local_process_id();
        if me == root {
            for rank in (0..self.number_of_processes()).filter(|&r| r != root) {
                self.send(rank, tags::BROADCAST, data)?;
            }
        } else {
            *data = self.receive(root, tags::BROADCAST)?;
        }
        Ok(())
    }

    fn trigger_rmi(&mut self, remote: i32, rmi: u32, data: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&rmi.to_le_bytes());
        payload.extend_from_slice(data);
        self.send(remote, tags::RMI, &payload)
    }

    /// Triggers `rmi` on every rank except this one, in rank order.
    fn trigger_rmi_on_all_children(&mut self, rmi: u32, data: &[u8]) -> Result<(), Error> {
        let me = self.local_process_id();
        for rank in (0..self.number_of_processes()).filter(|&r| r != me) {
            self.trigger_rmi(rank, rmi, data)?;
        }
        Ok(())
    }

    /// Blocks for the next RMI. Returns the sender, the RMI id and its data.
    fn receive_rmi(&mut self) -> Result<(i32, u32, Vec<u8>), Error> {
        let (_, envelope) = self.wait_any(&[Matcher::any_source(tags::RMI)], None)?;
        if envelope.payload.len() < 4 {
            return Err(Error::MalformedData("RMI message without id".to_string()));
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&envelope.payload[..4]);
        Ok((
            envelope.source,
            u32::from_le_bytes(id),
            envelope.payload[4..].to_vec(),
        ))
    }
}

// ============================================================================
// RMI Processing
// ============================================================================

/// Executes the RMIs a rank receives.
pub trait RmiHandler {
    /// Handles one RMI. The controller is passed back in so the handler can
    /// talk to other ranks while it runs.
    fn handle_rmi(
        &mut self,
        controller: &mut dyn ProcessController,
        source: i32,
        rmi: u32,
        data: &[u8],
    ) -> Result<(), Error>;
}

/// How long [`process_rmis`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmiLoop {
    /// Until a [`rmi::BREAK`] arrives.
    UntilBreak,
    /// Exactly one RMI.
    Once,
}

/// Receives RMIs and hands them to `handler`.
///
/// A failing handler is logged and does not end the loop; a failing receive
/// does, since the group can no longer deliver anything.
pub fn process_rmis(
    controller: &mut dyn ProcessController,
    handler: &mut dyn RmiHandler,
    mode: RmiLoop,
) -> Result<(), Error> {
    let rank = controller.local_process_id();
    loop {
        let (source, id, data) = controller.receive_rmi()?;
        if id == rmi::BREAK {
            debug!(rank, source, "Break received");
            return Ok(());
        }
        if let Err(err) = handler.handle_rmi(controller, source, id, &data) {
            warn!(rank, source, rmi = id, ?err, "RMI failed");
        }
        if mode == RmiLoop::Once {
            return Ok(());
        }
    }
}

// ============================================================================
// Gather Tree
// ============================================================================

/// Parent of `rank` in the binary gather tree, `None` for the root.
pub fn tree_parent(rank: i32) -> Option<i32> {
    (rank > 0).then(|| (rank - 1) / 2)
}

/// Children of `rank` in the binary gather tree of `size` ranks.
pub fn tree_children(rank: i32, size: i32) -> impl Iterator<Item = i32> {
    [2 * rank + 1, 2 * rank + 2]
        .into_iter()
        .filter(move |&child| child < size)
}

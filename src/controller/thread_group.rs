//! Process group whose ranks are threads of one OS process.
//!
//! Each rank owns a mailbox; a send pushes an [`Envelope`] into the
//! destination's mailbox. Receives take the earliest matching envelope and
//! park non-matching ones in a local queue until somebody asks for them,
//! which gives the same matching rules as tagged point-to-point messaging.

use super::{Envelope, Matcher, ProcessController};
use crate::error::Error;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};
use tracing::trace;

/// One rank of an in-process group. Create the whole group with
/// [`ThreadGroupController::group`] and move each rank to its own thread.
#[derive(Debug)]
pub struct ThreadGroupController {
    rank: i32,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
}

impl ThreadGroupController {
    /// Creates the ranks `0..size` of a new group.
    pub fn group(size: usize) -> Vec<ThreadGroupController> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadGroupController {
                rank: rank as i32,
                peers: senders.clone(),
                inbox,
                pending: VecDeque::new(),
            })
            .collect()
    }

    fn take_pending(&mut self, matchers: &[Matcher]) -> Option<(usize, Envelope)> {
        let (position, index) = self.pending.iter().enumerate().find_map(|(pos, env)| {
            matchers
                .iter()
                .position(|m| m.matches(env))
                .map(|index| (pos, index))
        })?;
        self.pending.remove(position).map(|env| (index, env))
    }
}

impl ProcessController for ThreadGroupController {
    fn local_process_id(&self) -> i32 {
        self.rank
    }

    fn number_of_processes(&self) -> i32 {
        self.peers.len() as i32
    }

    fn send(&mut self, destination: i32, tag: u32, data: &[u8]) -> Result<(), Error> {
        let peer = usize::try_from(destination)
            .ok()
            .and_then(|d| self.peers.get(d))
            .ok_or_else(|| Error::Controller(format!("no rank {destination} in group")))?;
        trace!(from = self.rank, to = destination, tag, len = data.len(), "Send");
        peer.send(Envelope {
            source: self.rank,
            tag,
            payload: data.to_vec(),
        })
        .map_err(|_| Error::Controller(format!("rank {destination} has left the group")))
    }

    fn wait_any(
        &mut self,
        matchers: &[Matcher],
        timeout: Option<Duration>,
    ) -> Result<(usize, Envelope), Error> {
        if let Some(found) = self.take_pending(matchers) {
            return Ok(found);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let envelope = match deadline {
                None => self
                    .inbox
                    .recv()
                    .map_err(|_| Error::Controller("process group shut down".to_string()))?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.inbox.recv_timeout(remaining) {
                        Ok(envelope) => envelope,
                        Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(Error::Controller("process group shut down".to_string()))
                        }
                    }
                }
            };

            if let Some(index) = matchers.iter().position(|m| m.matches(&envelope)) {
                trace!(rank = self.rank, from = envelope.source, tag = envelope.tag, "Receive");
                return Ok((index, envelope));
            }
            self.pending.push_back(envelope);
        }
    }

    fn try_receive(&mut self, matcher: Matcher) -> Result<Option<Envelope>, Error> {
        if let Some((_, envelope)) = self.take_pending(&[matcher]) {
            return Ok(Some(envelope));
        }
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) if matcher.matches(&envelope) => return Ok(Some(envelope)),
                Ok(envelope) => self.pending.push_back(envelope),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }
}

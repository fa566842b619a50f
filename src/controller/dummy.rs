use super::{Envelope, Matcher, ProcessController};
use crate::error::Error;
use std::time::Duration;

/// Controller of a group with a single process. There is nobody to talk to,
/// so every send or blocking receive fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyController;

impl ProcessController for DummyController {
    fn local_process_id(&self) -> i32 {
        0
    }

    fn number_of_processes(&self) -> i32 {
        1
    }

    fn send(&mut self, destination: i32, tag: u32, _data: &[u8]) -> Result<(), Error> {
        Err(Error::Controller(format!(
            "single-process group cannot send tag {tag} to rank {destination}"
        )))
    }

    fn wait_any(
        &mut self,
        _matchers: &[Matcher],
        _timeout: Option<Duration>,
    ) -> Result<(usize, Envelope), Error> {
        Err(Error::Controller(
            "single-process group has no peers to receive from".to_string(),
        ))
    }

    fn try_receive(&mut self, _matcher: Matcher) -> Result<Option<Envelope>, Error> {
        Ok(None)
    }
}

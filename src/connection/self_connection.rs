//! The local process, or the local process group, as one connection.

use crate::codec;
use crate::controller::{
    process_rmis, rmi, tags, tree_children, tree_parent, Matcher, ProcessController, RmiHandler,
    RmiLoop,
};
use crate::error::Error;
use crate::ids::{ConnectionId, GroupScope, ObjectHandle, ServerFlags};
use crate::information::{Information, InformationRegistry};
use crate::interpreter::{ClassRegistry, Interpreter, ModuleRegistry};
use crate::progress::{ProgressEvent, ProgressHandler, ProgressObserver};
use crate::stream::CommandStream;
use crate::transport::{Frame, FrameWriter};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// How a self connection spreads work over its process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// One process, nothing to spread.
    Single,
    /// Rank 0 drives; every other rank waits in an RMI loop and executes
    /// what the root triggers.
    RootWithSatellites,
    /// Every rank runs the same driving logic and acts as its own root.
    Synchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Finalized,
}

/// Connection to the local process (group).
#[derive(Debug)]
pub struct SelfConnection {
    id: ConnectionId,
    fan_out: FanOut,
    state: State,
    aborted: bool,
    controller: Box<dyn ProcessController>,
    local: LocalProcess,
}

/// Everything an RMI handler needs besides the controller.
#[derive(Debug)]
struct LocalProcess {
    interpreter: Interpreter,
    information: InformationRegistry,
    progress: ProgressHandler,
    sink: Option<FrameWriter>,
}

impl SelfConnection {
    pub fn new(
        id: ConnectionId,
        controller: Box<dyn ProcessController>,
        fan_out: FanOut,
        classes: ClassRegistry,
        modules: ModuleRegistry,
        information: InformationRegistry,
        progress_frequency: Duration,
    ) -> Self {
        let rank = controller.local_process_id();
        let size = controller.number_of_processes();
        let mut progress = match fan_out {
            FanOut::Synchronous => ProgressHandler::detached(),
            FanOut::RootWithSatellites if rank != 0 => {
                let mut relay = ProgressHandler::relay(progress_frequency);
                relay.prepare_progress();
                relay
            }
            _ => ProgressHandler::new(progress_frequency),
        };
        progress.set_partition(rank);

        Self {
            id,
            fan_out,
            state: State::Uninitialized,
            aborted: false,
            controller,
            local: LocalProcess {
                interpreter: Interpreter::new(classes, modules, rank, size),
                information,
                progress,
                sink: None,
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    pub fn partition_id(&self) -> i32 {
        self.controller.local_process_id()
    }

    pub fn number_of_partitions(&self) -> i32 {
        self.controller.number_of_processes()
    }

    /// Whether this rank only executes what the root sends.
    pub fn is_satellite(&self) -> bool {
        self.fan_out == FanOut::RootWithSatellites && self.partition_id() != 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.local.interpreter
    }

    pub fn progress_handler(&self) -> &ProgressHandler {
        &self.local.progress
    }

    pub fn progress_handler_mut(&mut self) -> &mut ProgressHandler {
        &mut self.local.progress
    }

    /// Switches the root's handler to relay mode, for a server whose objects
    /// are registered for progress on the client side.
    pub(crate) fn use_relay_progress(&mut self) {
        let frequency = self.local.progress.frequency();
        let mut relay = ProgressHandler::relay(frequency);
        relay.set_partition(self.partition_id());
        self.local.progress = relay;
    }

    /// Routes progress to a remote client instead of the local handler while
    /// a request from that client executes.
    pub(crate) fn set_progress_sink(&mut self, sink: Option<FrameWriter>) {
        self.local.sink = sink;
    }

    /// Starts the controller. A satellite stays in here, executing RMIs,
    /// until the root finalizes. Returns the local partition id.
    #[instrument(skip(self), fields(id = %self.id, fan_out = ?self.fan_out))]
    pub fn initialize(&mut self) -> Result<i32, Error> {
        if self.state != State::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }
        self.controller.initialize()?;
        self.state = State::Ready;
        let rank = self.partition_id();
        info!(
            rank,
            processes = self.number_of_partitions(),
            "Self connection initialized"
        );

        if self.is_satellite() {
            self.run_satellite()?;
        }
        Ok(rank)
    }

    fn run_satellite(&mut self) -> Result<(), Error> {
        debug!(rank = self.partition_id(), "Entering satellite RMI loop");
        let result = process_rmis(self.controller.as_mut(), &mut self.local, RmiLoop::UntilBreak);
        self.controller.finalize();
        self.state = State::Finalized;
        debug!(rank = self.partition_id(), "Satellite RMI loop done");
        result
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        match self.state {
            State::Ready => Ok(()),
            _ => Err(Error::NotInitialized),
        }
    }

    fn has_satellites(&self) -> bool {
        self.fan_out == FanOut::RootWithSatellites
            && !self.is_satellite()
            && self.number_of_partitions() > 1
    }

    /// Executes `stream` locally. With satellites and an all-processes scope,
    /// the stream is triggered on every satellite first.
    #[instrument(skip(self, stream), fields(id = %self.id, len = stream.len()))]
    pub fn send_stream(&mut self, flags: ServerFlags, stream: &CommandStream) -> Result<(), Error> {
        self.ensure_ready()?;
        if self.has_satellites() && flags.server_scope() == Some(GroupScope::All) {
            let data = stream.data()?;
            debug!(satellites = self.number_of_partitions() - 1, "Triggering stream on satellites");
            self.controller
                .trigger_rmi_on_all_children(rmi::STREAM, &data)
                .inspect_err(|err| error!(?err, "Failed to send stream to satellites"))?;
        }
        let result = self.local.execute(stream);
        self.drain_satellite_progress();
        result
    }

    /// Gathers `info` from the object bound to `handle`, merging the
    /// contributions of every rank unless the information is root-only.
    #[instrument(skip(self, info), fields(id = %self.id, info = info.type_tag(), %handle))]
    pub fn gather_information(
        &mut self,
        _flags: ServerFlags,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let object = self
            .local
            .interpreter
            .object(handle)
            .ok_or(Error::UnknownObject(handle.0))?;
        info.copy_from_object(object);

        if info.root_only() || self.number_of_partitions() == 1 {
            return Ok(());
        }

        match self.fan_out {
            FanOut::Single => Ok(()),
            FanOut::RootWithSatellites => {
                if self.is_satellite() {
                    return Err(Error::InvalidRole {
                        operation: "gather_information",
                        role: "satellite".to_string(),
                    });
                }
                self.gather_from_satellites(info, handle)
            }
            FanOut::Synchronous => self.gather_synchronous(info, handle),
        }
    }

    fn gather_from_satellites(
        &mut self,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        // Every rank must be able to decode the type, or the tree stalls.
        self.local.information.create(info.type_tag())?;

        let request = codec::encode(&(info.type_tag().to_string(), handle))?;
        self.controller
            .trigger_rmi_on_all_children(rmi::GATHER, &request)
            .inspect_err(|err| error!(?err, "Failed to trigger gather"))?;
        collect_information(self.controller.as_mut(), &mut self.local, info)
    }

    /// Rank 0 gathers through the tree and broadcasts the merged result; the
    /// other ranks serve exactly one gather RMI and then take the broadcast.
    fn gather_synchronous(
        &mut self,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        let mut data = Vec::new();
        if self.partition_id() == 0 {
            self.gather_from_satellites(info, handle)?;
            data = info.copy_to_stream()?;
            self.controller.broadcast(&mut data, 0)?;
        } else {
            process_rmis(self.controller.as_mut(), &mut self.local, RmiLoop::Once)?;
            self.controller.broadcast(&mut data, 0)?;
            info.copy_from_stream(&data)?;
        }
        trace!(len = data.len(), "Synchronous gather complete");
        Ok(())
    }

    pub fn last_result(&self) -> CommandStream {
        self.local.interpreter.last_result().clone()
    }

    /// Loads a module here and on every satellite. Reports the local result.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn load_module(&mut self, name: &str, directory: &str) -> Result<(), Error> {
        self.ensure_ready()?;
        if self.has_satellites() {
            let request = codec::encode(&(name.to_string(), directory.to_string()))?;
            self.controller
                .trigger_rmi_on_all_children(rmi::LOAD_MODULE, &request)?;
        }
        self.local.interpreter.load_module(name, directory)
    }

    pub fn prepare_progress(&mut self) {
        self.drain_satellite_progress();
        self.local.progress.prepare_progress();
    }

    pub fn cleanup_pending_progress(&mut self) {
        self.drain_satellite_progress();
        self.local.progress.cleanup_pending_progress();
    }

    /// Delivers progress satellites sent while the root was not waiting on
    /// them.
    fn drain_satellite_progress(&mut self) {
        if !self.has_satellites() {
            return;
        }
        loop {
            match self.controller.try_receive(Matcher::any_source(tags::PROGRESS)) {
                Ok(Some(envelope)) => self.local.deliver_encoded_progress(&envelope.payload),
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "Failed to poll satellite progress");
                    break;
                }
            }
        }
    }

    /// Releases the satellites (root only) and the controller. Safe to call
    /// more than once.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn finalize(&mut self) {
        if self.state != State::Ready {
            self.state = State::Finalized;
            return;
        }
        if self.has_satellites() {
            debug!("Releasing satellites");
            if let Err(err) = self.controller.trigger_rmi_on_all_children(rmi::BREAK, &[]) {
                error!(?err, "Failed to release satellites");
            }
        }
        self.controller.finalize();
        self.state = State::Finalized;
        info!("Self connection finalized");
    }
}

impl Drop for SelfConnection {
    fn drop(&mut self) {
        self.finalize();
    }
}

// ============================================================================
// Local Execution
// ============================================================================

impl LocalProcess {
    fn execute(&mut self, stream: &CommandStream) -> Result<(), Error> {
        let mut observer = LocalProgress {
            handler: &mut self.progress,
            sink: self.sink.as_mut(),
        };
        self.interpreter.process_stream(stream, &mut observer)
    }

    fn deliver_encoded_progress(&mut self, payload: &[u8]) {
        match codec::decode::<ProgressEvent>(payload) {
            Ok(event) => self.deliver_progress(event),
            Err(err) => warn!(?err, "Dropping malformed progress message"),
        }
    }

    fn deliver_progress(&mut self, event: ProgressEvent) {
        match self.sink.as_mut() {
            Some(sink) => {
                if let Err(err) = sink.send_frame(&Frame::Progress(event)) {
                    warn!(?err, "Failed to forward progress");
                }
            }
            None => self.progress.accept(event),
        }
    }
}

impl RmiHandler for LocalProcess {
    fn handle_rmi(
        &mut self,
        controller: &mut dyn ProcessController,
        source: i32,
        rmi: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        trace!(rank = controller.local_process_id(), source, rmi, "Handling RMI");
        match rmi {
            rmi::STREAM => {
                let stream = CommandStream::from_data(data)?;
                let mut observer = SatelliteProgress {
                    handler: &mut self.progress,
                    controller: &mut *controller,
                };
                self.interpreter.process_stream(&stream, &mut observer)
            }
            rmi::GATHER => {
                let (tag, handle): (String, ObjectHandle) = codec::decode(data)?;
                let mut info = self.information.create(&tag)?;
                match self.interpreter.object(handle) {
                    Some(object) => info.copy_from_object(object),
                    None => debug!(%handle, "No local object to gather from"),
                }
                collect_information(controller, self, info.as_mut())
            }
            rmi::LOAD_MODULE => {
                let (name, directory): (String, String) = codec::decode(data)?;
                self.interpreter.load_module(&name, &directory)
            }
            other => {
                warn!(rmi = other, "Unknown RMI");
                Ok(())
            }
        }
    }
}

/// Merges the children's information into `info` and passes the result to
/// the parent. A rank sends only after both children have reported.
///
/// While waiting on a child, progress messages are delivered as they
/// arrive; the wait resumes afterwards.
fn collect_information(
    controller: &mut dyn ProcessController,
    local: &mut LocalProcess,
    info: &mut dyn Information,
) -> Result<(), Error> {
    let rank = controller.local_process_id();
    let size = controller.number_of_processes();

    for child in tree_children(rank, size) {
        let matchers = [
            Matcher::exact(child, tags::COLLECT),
            Matcher::any_source(tags::PROGRESS),
        ];
        loop {
            let (index, envelope) = controller.wait_any(&matchers, None)?;
            if index == 1 {
                local.deliver_encoded_progress(&envelope.payload);
                continue;
            }
            let mut other = local.information.create(info.type_tag())?;
            other.copy_from_stream(&envelope.payload)?;
            info.add_information(other.as_ref());
            trace!(rank, child, "Merged child information");
            break;
        }
    }

    if let Some(parent) = tree_parent(rank) {
        controller.send(parent, tags::COLLECT, &info.copy_to_stream()?)?;
        trace!(rank, parent, "Sent information to parent");
    }
    Ok(())
}

// ============================================================================
// Progress Observers
// ============================================================================

/// Progress of work running on the root. Filtered by the root's handler,
/// then surfaced locally or forwarded to a remote client.
struct LocalProgress<'a> {
    handler: &'a mut ProgressHandler,
    sink: Option<&'a mut FrameWriter>,
}

impl ProgressObserver for LocalProgress<'_> {
    fn report(&mut self, source: ObjectHandle, fraction: f64, text: &str) {
        let Some(event) = self.handler.filter(source, fraction, text) else {
            return;
        };
        match self.sink.as_mut() {
            Some(sink) => {
                if let Err(err) = sink.send_frame(&Frame::Progress(event)) {
                    warn!(?err, "Failed to forward progress");
                }
            }
            None => self.handler.surface(event),
        }
    }
}

/// Progress of work running on a satellite, sent to rank 0.
struct SatelliteProgress<'a> {
    handler: &'a mut ProgressHandler,
    controller: &'a mut dyn ProcessController,
}

impl ProgressObserver for SatelliteProgress<'_> {
    fn report(&mut self, source: ObjectHandle, fraction: f64, text: &str) {
        let Some(event) = self.handler.filter(source, fraction, text) else {
            return;
        };
        let sent = codec::encode(&event).and_then(|payload| self.controller.send(0, tags::PROGRESS, &payload));
        if let Err(err) = sent {
            warn!(?err, "Failed to send progress to root");
        }
    }
}

//! Progress reporting for long-running requests.
//!
//! Objects executing a request report progress through a
//! [`ProgressObserver`]. Each connection owns a [`ProgressHandler`] that
//! decides whether a report is accepted (inside a prepare/cleanup window,
//! from a registered object, not too frequent) and surfaces accepted events
//! to the caller. Where the report has to travel to another process first,
//! the connection wraps the handler in an observer that forwards the
//! filtered event over its socket or process controller.

use crate::ids::ObjectHandle;
use bincode::{Decode, Encode};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ProgressEvent {
    /// Object that reported progress.
    pub source: ObjectHandle,
    /// Identifier given to [`ProgressHandler::register_progress_event`].
    pub id: u32,
    /// Partition (rank) the object lives on.
    pub partition: i32,
    /// Completion in percent, 0 to 100.
    pub progress: u8,
    pub text: String,
}

/// Receiver of raw progress reports emitted while a request executes.
pub trait ProgressObserver {
    /// `fraction` is clamped to `0.0..=1.0`.
    fn report(&mut self, source: ObjectHandle, fraction: f64, text: &str);
}

/// Observer that drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressObserver;

impl ProgressObserver for NullProgressObserver {
    fn report(&mut self, _source: ObjectHandle, _fraction: f64, _text: &str) {}
}

/// Per-connection progress state.
#[derive(Debug)]
pub struct ProgressHandler {
    enabled: bool,
    relay: bool,
    active: bool,
    frequency: Duration,
    partition: i32,
    last_report: Option<Instant>,
    registered: HashMap<ObjectHandle, u32>,
    surfaced: VecDeque<ProgressEvent>,
    discarded: usize,
}

impl ProgressHandler {
    pub fn new(frequency: Duration) -> Self {
        Self {
            enabled: true,
            relay: false,
            active: false,
            frequency,
            partition: 0,
            last_report: None,
            registered: HashMap::new(),
            surfaced: VecDeque::new(),
            discarded: 0,
        }
    }

    /// A handler that never accepts anything. Used where every process runs
    /// the same logic and there is no remote progress to observe.
    pub fn detached() -> Self {
        let mut handler = Self::new(Duration::ZERO);
        handler.enabled = false;
        handler
    }

    /// A handler for a process that executes on behalf of another one. It
    /// does not know which objects the other side registered, so it passes
    /// every source (rate limited) and leaves the filtering to the receiver.
    pub fn relay(frequency: Duration) -> Self {
        let mut handler = Self::new(frequency);
        handler.relay = true;
        handler
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a prepare/cleanup window is open.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: Duration) {
        self.frequency = frequency;
    }

    pub(crate) fn set_partition(&mut self, partition: i32) {
        self.partition = partition;
    }

    /// Resets counters and starts accepting progress.
    pub fn prepare_progress(&mut self) {
        if !self.enabled {
            return;
        }
        debug!(partition = self.partition, "Preparing progress");
        self.active = true;
        self.last_report = None;
        self.discarded = 0;
    }

    /// Closes the window. Anything arriving afterwards is discarded.
    pub fn cleanup_pending_progress(&mut self) {
        if self.active {
            debug!(
                partition = self.partition,
                discarded = self.discarded,
                "Cleaning up pending progress"
            );
        }
        self.active = false;
        self.last_report = None;
    }

    /// Accepts progress from `source`, labelled with `id`.
    pub fn register_progress_event(&mut self, source: ObjectHandle, id: u32) {
        trace!(%source, id, "Registering progress source");
        self.registered.insert(source, id);
    }

    pub fn unregister_progress_event(&mut self, source: ObjectHandle) {
        self.registered.remove(&source);
    }

    pub fn is_registered(&self, source: ObjectHandle) -> bool {
        self.registered.contains_key(&source)
    }

    /// Turns a raw report into an event, or `None` when it must not be
    /// reported: outside the window, from an unregistered object, or sooner
    /// than the configured frequency allows. Start and completion are never
    /// rate limited.
    pub fn filter(&mut self, source: ObjectHandle, fraction: f64, text: &str) -> Option<ProgressEvent> {
        if !self.enabled || !self.active {
            self.discarded += 1;
            return None;
        }
        let id = match self.registered.get(&source) {
            Some(id) => *id,
            None if self.relay => 0,
            None => return None,
        };
        let progress = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;

        let now = Instant::now();
        let boundary = progress == 0 || progress == 100;
        if !boundary {
            if let Some(last) = self.last_report {
                if now.duration_since(last) < self.frequency {
                    trace!(%source, progress, "Progress rate limited");
                    return None;
                }
            }
        }
        self.last_report = Some(now);

        Some(ProgressEvent {
            source,
            id,
            partition: self.partition,
            progress,
            text: text.to_string(),
        })
    }

    /// Takes an event produced by another process. Outside relay mode the
    /// source must be registered here; its registered id replaces whatever
    /// the sender put in.
    pub fn accept(&mut self, mut event: ProgressEvent) {
        if !self.relay {
            match self.registered.get(&event.source) {
                Some(id) => event.id = *id,
                None => {
                    trace!(source = %event.source, "Discarding progress from unregistered source");
                    return;
                }
            }
        }
        self.surface(event);
    }

    /// Hands an event to the caller if the window is open.
    pub fn surface(&mut self, event: ProgressEvent) {
        if !self.enabled || !self.active {
            trace!(source = %event.source, "Discarding progress outside window");
            self.discarded += 1;
            return;
        }
        debug!(
            source = %event.source,
            partition = event.partition,
            progress = event.progress,
            text = %event.text,
            "Progress"
        );
        self.surfaced.push_back(event);
    }

    /// Removes and returns every surfaced event.
    pub fn take_events(&mut self) -> Vec<ProgressEvent> {
        self.surfaced.drain(..).collect()
    }

    pub fn pending_events(&self) -> usize {
        self.surfaced.len()
    }
}

impl ProgressObserver for ProgressHandler {
    fn report(&mut self, source: ObjectHandle, fraction: f64, text: &str) {
        if let Some(event) = self.filter(source, fraction, text) {
            self.surface(event);
        }
    }
}

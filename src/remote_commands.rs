//! Routing of OS transport intents to the application layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::broadcast;

use crate::protocol::{Message, RemoteCommand};

/// Last-known transport facts shared between the projector, the command
/// router, and the head-unit surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportState {
    pub is_playing: bool,
    pub liked: bool,
    pub has_track: bool,
}

pub type SharedTransportState = Arc<Mutex<TransportState>>;

pub fn transport_snapshot(shared: &SharedTransportState) -> TransportState {
    match shared.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Intent received from an OS transport surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportIntent {
    Play,
    Pause,
    TogglePlayPause,
    Next,
    Previous,
    ScrubToPosition(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOutcome {
    Handled,
    Failed,
}

pub struct RemoteCommandRouter {
    bus_producer: broadcast::Sender<Message>,
    transport: SharedTransportState,
    attached: AtomicBool,
}

impl RemoteCommandRouter {
    pub fn new(bus_producer: broadcast::Sender<Message>, transport: SharedTransportState) -> Self {
        RemoteCommandRouter {
            bus_producer,
            transport,
            attached: AtomicBool::new(false),
        }
    }

    /// Handles one transport intent. The acknowledgement is synchronous;
    /// the command itself travels on the bus and is executed by the
    /// application layer whenever it gets to it.
    ///
    /// Position scrubbing is not supported by the playback engine, so the
    /// scrub intent reports failure and the widget keeps its own timeline.
    pub fn handle_intent(&self, intent: TransportIntent) -> IntentOutcome {
        let command = match intent {
            TransportIntent::Play => RemoteCommand::Play,
            TransportIntent::Pause => RemoteCommand::Pause,
            TransportIntent::TogglePlayPause => {
                if transport_snapshot(&self.transport).is_playing {
                    RemoteCommand::Pause
                } else {
                    RemoteCommand::Play
                }
            }
            TransportIntent::Next => RemoteCommand::Next,
            TransportIntent::Previous => RemoteCommand::Previous,
            TransportIntent::ScrubToPosition(position) => {
                debug!("RemoteCommandRouter: rejecting scrub to {position}");
                return IntentOutcome::Failed;
            }
        };
        self.send(command);
        IntentOutcome::Handled
    }

    /// Routes the head-unit like button back to the application layer.
    pub fn send_toggle_like(&self) {
        self.send(RemoteCommand::ToggleLike);
    }

    /// Marks the OS surface attachment done. Returns true only the first
    /// time, so repeated widget setup never double-registers handlers.
    pub fn mark_attached(&self) -> bool {
        !self.attached.swap(true, Ordering::SeqCst)
    }

    fn send(&self, command: RemoteCommand) {
        if self.bus_producer.send(Message::Remote(command)).is_err() {
            warn!("RemoteCommandRouter: no bus receivers for {command:?}");
        }
    }
}

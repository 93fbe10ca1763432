//! Event system for front-end decoupling.
//!
//! Lets a CLI or any other front end follow an update without being coupled
//! to the orchestration logic.

use std::fmt;

use crate::state::UpdatePhase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Transport packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Request (host -> broker)
    Rx, // Reply (broker -> host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// Image decoded and split into pages.
    ImageLoaded {
        records: usize,
        pages: usize,
        bytes: usize,
    },
    /// A page is about to be written.
    PageStarted { index: usize, base: u16 },
    /// The device acknowledged the commit of a page.
    PageCommitted { index: usize, base: u16 },
    /// Pages done so far.
    Progress { current: usize, total: usize },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Transport payloads sent/received.
    Packet {
        direction: PacketDirection,
        frames: usize,
        length: usize,
    },
    /// The run stopped on an error.
    Aborted { message: String },
    /// Device rebooted into the new firmware.
    Complete,
}

/// Observer trait for receiving update events.
///
/// Implement this trait in the front end to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::ImageLoaded {
                records,
                pages,
                bytes,
            } => {
                tracing::info!(records, pages, bytes, "Image loaded");
            }
            UpdateEvent::PageStarted { index, base } => {
                tracing::debug!(page = index, addr = %format!("0x{:04X}", base), "Writing page");
            }
            UpdateEvent::PageCommitted { index, base } => {
                tracing::info!(page = index, addr = %format!("0x{:04X}", base), "Page committed");
            }
            UpdateEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(progress = %format!("{}%", pct), "{}/{} pages", current, total);
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Packet {
                direction,
                frames,
                length,
            } => {
                tracing::trace!(dir = %direction, frames, len = length, "Packet");
            }
            UpdateEvent::Aborted { message } => {
                tracing::error!("Update aborted: {}", message);
            }
            UpdateEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event, for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub events: Mutex<Vec<UpdateEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<UpdateEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl UpdateObserver for RecordingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::default();
        observer.on_event(&UpdateEvent::Complete);
        NullObserver.on_event(&UpdateEvent::Complete);
        TracingObserver.on_event(&UpdateEvent::Progress {
            current: 1,
            total: 0,
        });
        assert_eq!(observer.events(), vec![UpdateEvent::Complete]);
    }

    #[test]
    fn test_packet_direction_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }
}

//! Update Session - High-level orchestrator for flashing one device.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::events::{PacketDirection, TracingObserver, UpdateEvent, UpdateObserver};
use crate::ihex::{LineError, RecordPolicy, decode_file};
use crate::page::{AssemblyError, assemble};
use crate::protocol::{ConfigError, ExchangeError, ProtocolRevision, RequestCodec, SlaveId};
use crate::state::machine::{SessionState, UpdatePhase};
use crate::state::steps::{
    StepContext, commit_page, fill_page, reboot, reset_watchdog, verify_counter,
};
use crate::transport::{Endpoint, RpcTransport, TransportError};

/// Configuration for an update session.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the Intel-HEX firmware image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
    /// Target device id (1..=255).
    pub slave_id: u8,
    /// Handling of extended address and start address records.
    #[serde(default)]
    pub record_policy: RecordPolicy,
    /// Broker and service the device is reached through.
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Bootloader protocol revision.
    #[serde(default)]
    pub revision: ProtocolRevision,
}

impl SessionConfig {
    pub fn new(firmware_path: impl Into<String>, endpoint: Endpoint, slave_id: u8) -> Self {
        Self {
            firmware_path: Some(firmware_path.into()),
            endpoint,
            slave_id,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.revision.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("no firmware file configured")]
    NoFirmware,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid protocol revision: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid slave id {0}, must be 1..=255")]
    InvalidSlave(u8),

    #[error("failed to decode image: {0}")]
    Decode(#[from] LineError),

    #[error("failed to assemble pages: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("image needs {pages} pages but the progress counter only counts {limit}")]
    TooManyPages { pages: usize, limit: usize },

    #[error("transport to {endpoint} is not connected")]
    NotConnected { endpoint: String },

    #[error("page {index} (addr 0x{base:04X}) failed during {phase}: {source}")]
    Page {
        index: usize,
        base: u16,
        phase: UpdatePhase,
        #[source]
        source: ExchangeError,
    },

    #[error("reboot failed: {0}")]
    Reboot(#[source] ExchangeError),
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub records: usize,
    pub pages: usize,
    pub bytes: usize,
}

/// Update Session - flashes one image onto one device.
pub struct UpdateSession<T: RpcTransport, O: UpdateObserver> {
    config: SessionConfig,
    transport: T,
    observer: Arc<O>,
}

impl<T: RpcTransport> UpdateSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self::with_observer(config, transport, Arc::new(TracingObserver))
    }
}

impl<T: RpcTransport, O: UpdateObserver> UpdateSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, transport: T, observer: Arc<O>) -> Self {
        Self {
            config,
            transport,
            observer,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Read the configured firmware file and flash it.
    #[instrument(skip(self), fields(endpoint = %self.config.endpoint, slave = self.config.slave_id))]
    pub fn run(&self) -> Result<UpdateSummary, UpdateError> {
        let path = self
            .config
            .firmware_path
            .as_deref()
            .ok_or(UpdateError::NoFirmware)?;
        info!(path = %path, "Loading firmware image");
        let text = std::fs::read_to_string(path).map_err(|source| UpdateError::Io {
            path: path.to_string(),
            source,
        })?;
        self.flash_image(&text)
    }

    /// Flash an Intel-HEX image given as text.
    ///
    /// The image is decoded and split into pages before the device is
    /// contacted; nothing is sent when either step fails.
    pub fn flash_image(&self, text: &str) -> Result<UpdateSummary, UpdateError> {
        let mut state = SessionState::new();
        let result = self.execute(text, &mut state);

        if let Err(e) = &result {
            let from = state.phase;
            state.goto_phase(UpdatePhase::Aborted);
            self.observer.on_event(&UpdateEvent::PhaseChanged {
                from,
                to: UpdatePhase::Aborted,
            });
            error!(phase = %from, error = %e, "Update aborted");
            self.observer.on_event(&UpdateEvent::Aborted {
                message: e.to_string(),
            });
        }
        result
    }

    fn goto(&self, state: &mut SessionState, phase: UpdatePhase) {
        let from = state.phase;
        state.goto_phase(phase);
        self.observer
            .on_event(&UpdateEvent::PhaseChanged { from, to: phase });
    }

    fn execute(&self, text: &str, state: &mut SessionState) -> Result<UpdateSummary, UpdateError> {
        let revision = &self.config.revision;
        revision.validate()?;
        let slave = SlaveId::new(self.config.slave_id)
            .ok_or(UpdateError::InvalidSlave(self.config.slave_id))?;

        self.goto(state, UpdatePhase::Decoding);
        let records = decode_file(text)?;

        self.goto(state, UpdatePhase::Assembling);
        let pages = assemble(&records, revision.page_size, self.config.record_policy)?;
        let bytes: usize = pages.iter().map(|p| p.size()).sum();
        info!(
            records = records.len(),
            pages = pages.len(),
            revision = %revision.name,
            "Image ready"
        );
        self.observer.on_event(&UpdateEvent::ImageLoaded {
            records: records.len(),
            pages: pages.len(),
            bytes,
        });
        let limit = 1usize << (8 * usize::from(revision.register_map.progress_width));
        if pages.len() > limit {
            return Err(UpdateError::TooManyPages {
                pages: pages.len(),
                limit,
            });
        }
        state.total_pages = pages.len();

        if !self.transport.is_connected() {
            return Err(UpdateError::NotConnected {
                endpoint: self.config.endpoint.to_string(),
            });
        }

        let codec = RequestCodec::new(revision);
        let transport = ObservableTransport {
            inner: &self.transport,
            observer: self.observer.as_ref(),
        };
        let mut ctx = StepContext {
            transport: &transport,
            observer: self.observer.as_ref(),
            codec: &codec,
            endpoint: &self.config.endpoint,
            slave,
            state,
        };

        for (index, page) in pages.iter().enumerate() {
            ctx.emit(UpdateEvent::PageStarted {
                index,
                base: page.base(),
            });

            let result = (|| -> Result<(), ExchangeError> {
                verify_counter(&mut ctx)?;
                if revision.watchdog_reset {
                    reset_watchdog(&mut ctx)?;
                }
                fill_page(&mut ctx, page)?;
                commit_page(&mut ctx, page)
            })();
            result.map_err(|source| UpdateError::Page {
                index,
                base: page.base(),
                phase: ctx.state.phase,
                source,
            })?;

            ctx.goto(UpdatePhase::Advance);
            ctx.state.advance(page.size());
            ctx.emit(UpdateEvent::Progress {
                current: ctx.state.expected_page_counter,
                total: ctx.state.total_pages,
            });

            let delay = revision.inter_page_delay();
            if !ctx.state.is_complete() && !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        reboot(&mut ctx).map_err(UpdateError::Reboot)?;
        let flashed = ctx.state.bytes_flashed;
        ctx.goto(UpdatePhase::Done);
        ctx.emit(UpdateEvent::Complete);

        Ok(UpdateSummary {
            records: records.len(),
            pages: pages.len(),
            bytes: flashed,
        })
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: RpcTransport, O: UpdateObserver> {
    inner: &'a T,
    observer: &'a O,
}

impl<'a, T: RpcTransport, O: UpdateObserver> RpcTransport for ObservableTransport<'a, T, O> {
    fn call(
        &self,
        endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        self.observer.on_event(&UpdateEvent::Packet {
            direction: PacketDirection::Tx,
            frames: request.len(),
            length: request.iter().map(Vec::len).sum(),
        });
        let res = self.inner.call(endpoint, request);
        if let Ok(reply) = &res {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Rx,
                frames: reply.len(),
                length: reply.iter().map(Vec::len).sum(),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

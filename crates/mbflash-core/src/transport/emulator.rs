//! Register-level bootloader emulator.
//!
//! Answers request batches the way a broker worker in front of a real
//! bootloader would: the progress counter only advances when a full page
//! buffer is committed, and every reply is wrapped in the revision's reply
//! convention. Used to drive the update session end to end in tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::traits::{Endpoint, RpcTransport, TransportError};
use crate::protocol::{
    ControlFlag, Endianness, ProtocolRevision, ReplyConvention, ReplyFrame, RequestFrame,
};

/// A register operation observed by the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    ReadProgress,
    SetPageAddress(u16),
    WritePageData(usize),
    Commit,
    WatchdogReset,
    Reboot,
    Control(u8),
    Other { function: u8, address: u16 },
}

#[derive(Debug, Default)]
struct DeviceState {
    counter: u16,
    page_address: Option<u16>,
    buffer: Vec<u8>,
    flash: BTreeMap<u16, Vec<u8>>,
    ops: Vec<DeviceOp>,
    calls: usize,
    progress_script: VecDeque<u16>,
    fail_after: Option<usize>,
    rebooted: bool,
}

pub struct DeviceEmulator {
    revision: ProtocolRevision,
    state: Mutex<DeviceState>,
}

impl DeviceEmulator {
    pub fn new(revision: ProtocolRevision) -> Self {
        Self {
            revision,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Start with the progress counter at `counter`, as after an interrupted run.
    pub fn with_counter(self, counter: u16) -> Self {
        self.lock().counter = counter;
        self
    }

    /// Report these counter values to the next progress reads instead of the
    /// real counter.
    pub fn script_progress(&self, values: impl IntoIterator<Item = u16>) {
        self.lock().progress_script.extend(values);
    }

    /// Fail every call after the first `calls` ones.
    pub fn fail_after(&self, calls: usize) {
        self.lock().fail_after = Some(calls);
    }

    pub fn counter(&self) -> u16 {
        self.lock().counter
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.lock().ops.clone()
    }

    /// Number of transport calls answered or refused.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn rebooted(&self) -> bool {
        self.lock().rebooted
    }

    /// Committed pages by base address.
    pub fn flash(&self) -> BTreeMap<u16, Vec<u8>> {
        self.lock().flash.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, state: &mut DeviceState, frame: &RequestFrame) -> ReplyFrame {
        let map = &self.revision.register_map;
        let reply = ReplyFrame::echo(frame);
        let value = frame.value.as_deref().unwrap_or_default();

        if frame.function.is_read() {
            if frame.address == map.progress_register() {
                state.ops.push(DeviceOp::ReadProgress);
                let counter = state.progress_script.pop_front().unwrap_or(state.counter);
                let mut bytes = [0u8; 2];
                LittleEndian::write_u16(&mut bytes, counter);
                let width = usize::from(map.progress_width);
                return reply.with_value(bytes[..width].iter().map(|&b| i64::from(b)).collect());
            }
            state.ops.push(DeviceOp::Other {
                function: frame.function.code(),
                address: frame.address,
            });
            return reply.with_value(vec![0; usize::from(frame.count)]);
        }

        if frame.address == map.page_address_register() && value.len() == 2 {
            let address = match map.page_address_order {
                Endianness::Little => LittleEndian::read_u16(value),
                Endianness::Big => BigEndian::read_u16(value),
            };
            state.page_address = Some(address);
            state.ops.push(DeviceOp::SetPageAddress(address));
        } else if frame.address == map.page_data_register() {
            state.buffer = value.to_vec();
            state.ops.push(DeviceOp::WritePageData(value.len()));
        } else if frame.address == map.control_register() && value.len() == 1 {
            let mask = value[0];
            match map.flags.flag_for(mask) {
                Some(ControlFlag::FlashPageUpdate) => {
                    state.ops.push(DeviceOp::Commit);
                    self.commit(state);
                }
                Some(ControlFlag::WatchdogReset) => state.ops.push(DeviceOp::WatchdogReset),
                Some(ControlFlag::Reboot) => {
                    state.ops.push(DeviceOp::Reboot);
                    state.rebooted = true;
                }
                _ => state.ops.push(DeviceOp::Control(mask)),
            }
        } else {
            state.ops.push(DeviceOp::Other {
                function: frame.function.code(),
                address: frame.address,
            });
        }
        reply
    }

    fn commit(&self, state: &mut DeviceState) {
        let full = state.buffer.len() == usize::from(self.revision.page_size);
        match state.page_address {
            Some(address) if full => {
                let page = std::mem::take(&mut state.buffer);
                state.flash.insert(address, page);
                state.counter = state.counter.wrapping_add(1);
                debug!(
                    addr = %format!("0x{:04X}", address),
                    counter = state.counter,
                    "Emulated page programmed"
                );
            }
            _ => debug!(
                buffered = state.buffer.len(),
                "Commit ignored, page buffer not full"
            ),
        }
    }

    fn envelope(&self, frames: &[ReplyFrame]) -> Result<Vec<Vec<u8>>, TransportError> {
        let body = serde_json::to_vec(frames)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        Ok(match &self.revision.reply {
            ReplyConvention::Bare => vec![body],
            ReplyConvention::StatusPrefixed { success } => {
                vec![success.as_bytes().to_vec(), body]
            }
        })
    }
}

impl RpcTransport for DeviceEmulator {
    fn call(
        &self,
        _endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut state = self.lock();
        state.calls += 1;
        if let Some(limit) = state.fail_after
            && state.calls > limit
        {
            return Err(TransportError::Timeout { timeout_ms: 5000 });
        }

        let [payload] = request.as_slice() else {
            return Err(TransportError::SendFailed(format!(
                "expected one payload, got {}",
                request.len()
            )));
        };
        let frames: Vec<RequestFrame> = serde_json::from_slice(payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(frames = frames.len(), "Emulator received batch");

        let replies: Vec<ReplyFrame> = frames
            .iter()
            .map(|frame| self.handle(&mut state, frame))
            .collect();
        self.envelope(&replies)
    }
}

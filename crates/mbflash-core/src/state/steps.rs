//! Per-page protocol steps.
//!
//! Each step moves the session to its phase, performs one request/reply
//! exchange and validates the outcome. Any error ends the run.

use tracing::{debug, info, warn};

use crate::events::{LogLevel, UpdateEvent, UpdateObserver};
use crate::page::FlashPage;
use crate::protocol::{
    CodecError, ControlFlag, ExchangeError, ReplyFrame, RequestCodec, RequestFrame, SlaveId,
};
use crate::state::machine::{SessionState, UpdatePhase};
use crate::transport::{Endpoint, RpcTransport};

/// Resources shared by every step of a run.
pub struct StepContext<'a, T: RpcTransport, O: UpdateObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub codec: &'a RequestCodec,
    pub endpoint: &'a Endpoint,
    pub slave: SlaveId,
    pub state: &'a mut SessionState,
}

impl<'a, T: RpcTransport, O: UpdateObserver> StepContext<'a, T, O> {
    pub fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn goto(&mut self, phase: UpdatePhase) {
        let from = self.state.phase;
        self.state.goto_phase(phase);
        self.emit(UpdateEvent::PhaseChanged { from, to: phase });
    }

    fn exchange(&self, batch: &[RequestFrame]) -> Result<Vec<ReplyFrame>, ExchangeError> {
        self.codec.exchange(self.transport, self.endpoint, batch)
    }

    fn control(&self, flag: ControlFlag) -> Result<(), ExchangeError> {
        let batch = self.codec.encode_control(self.slave, flag)?;
        self.exchange(&batch)?;
        Ok(())
    }
}

/// Read the device progress counter and require it to match the page about
/// to be written.
pub fn verify_counter<T: RpcTransport, O: UpdateObserver>(
    ctx: &mut StepContext<'_, T, O>,
) -> Result<(), ExchangeError> {
    ctx.goto(UpdatePhase::VerifyCounter);
    let batch = ctx.codec.encode_read_progress(ctx.slave);
    let reply = ctx.exchange(&batch)?;
    let counter = ctx.codec.decode_progress(&reply)?;

    let expected = ctx.state.expected_page_counter;
    if usize::from(counter) != expected {
        warn!(counter, expected, "Device progress counter mismatch");
        return Err(CodecError::CounterMismatch {
            expected,
            actual: counter,
        }
        .into());
    }
    debug!(counter, "Progress counter verified");
    Ok(())
}

/// Feed the bootloader watchdog ahead of the slow page write.
pub fn reset_watchdog<T: RpcTransport, O: UpdateObserver>(
    ctx: &mut StepContext<'_, T, O>,
) -> Result<(), ExchangeError> {
    ctx.goto(UpdatePhase::WatchdogReset);
    ctx.control(ControlFlag::WatchdogReset)
}

/// Set the page address and load the page buffer.
pub fn fill_page<T: RpcTransport, O: UpdateObserver>(
    ctx: &mut StepContext<'_, T, O>,
    page: &FlashPage,
) -> Result<(), ExchangeError> {
    ctx.goto(UpdatePhase::FillPage);
    let batch = ctx.codec.encode_fill_page(ctx.slave, page);
    ctx.exchange(&batch)?;
    debug!(page = %page, "Page buffer filled");
    Ok(())
}

/// Ask the device to program the filled buffer.
pub fn commit_page<T: RpcTransport, O: UpdateObserver>(
    ctx: &mut StepContext<'_, T, O>,
    page: &FlashPage,
) -> Result<(), ExchangeError> {
    ctx.goto(UpdatePhase::CommitPage);
    ctx.control(ControlFlag::FlashPageUpdate)?;
    ctx.emit(UpdateEvent::PageCommitted {
        index: ctx.state.expected_page_counter,
        base: page.base(),
    });
    Ok(())
}

/// Restart the device into the new firmware.
pub fn reboot<T: RpcTransport, O: UpdateObserver>(
    ctx: &mut StepContext<'_, T, O>,
) -> Result<(), ExchangeError> {
    ctx.goto(UpdatePhase::Reboot);
    ctx.control(ControlFlag::Reboot)?;
    info!(slave = %ctx.slave, "Reboot requested");
    ctx.log(LogLevel::Info, "Device rebooting into new firmware");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::ProtocolRevision;
    use crate::transport::{MockTransport, TransportError};

    struct Fixture {
        transport: MockTransport,
        codec: RequestCodec,
        endpoint: Endpoint,
        state: SessionState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transport: MockTransport::new(),
                codec: RequestCodec::new(&ProtocolRevision::v2()),
                endpoint: Endpoint::new("tcp://localhost:5555", "rtu"),
                state: SessionState::new(),
            }
        }

        fn ctx(&mut self) -> StepContext<'_, MockTransport, NullObserver> {
            StepContext {
                transport: &self.transport,
                observer: &NullObserver,
                codec: &self.codec,
                endpoint: &self.endpoint,
                slave: SlaveId::new(2).unwrap(),
                state: &mut self.state,
            }
        }

        fn queue_counter(&self, counter: i64) {
            self.transport.queue_frames(
                Some("OK"),
                &[ReplyFrame {
                    slave: 2,
                    function: Some(65),
                    address: Some(0x2002),
                    count: Some(1),
                    value: Some(vec![counter]),
                }],
            );
        }

        fn queue_acks(&self, frames: usize) {
            let ack = ReplyFrame {
                slave: 2,
                function: None,
                address: None,
                count: None,
                value: None,
            };
            self.transport.queue_frames(Some("OK"), &vec![ack; frames]);
        }
    }

    #[test]
    fn test_verify_counter_match() {
        let mut fx = Fixture::new();
        fx.state.expected_page_counter = 3;
        fx.queue_counter(3);
        verify_counter(&mut fx.ctx()).unwrap();
        assert_eq!(fx.state.phase, UpdatePhase::VerifyCounter);
    }

    #[test]
    fn test_verify_counter_mismatch() {
        let mut fx = Fixture::new();
        fx.queue_counter(1);
        let err = verify_counter(&mut fx.ctx()).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Protocol(CodecError::CounterMismatch {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_verify_counter_range_error() {
        let mut fx = Fixture::new();
        fx.queue_counter(300);
        match verify_counter(&mut fx.ctx()) {
            Err(ExchangeError::Protocol(e)) => assert!(e.is_range()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_fill_and_commit() {
        let mut fx = Fixture::new();
        let mut page = FlashPage::new(2, 0x0040);
        page.append(0x40, 1).unwrap();
        page.append(0x41, 2).unwrap();

        fx.queue_acks(2);
        fx.queue_acks(1);
        fill_page(&mut fx.ctx(), &page).unwrap();
        commit_page(&mut fx.ctx(), &page).unwrap();

        let calls = fx.transport.get_calls();
        assert_eq!(calls.len(), 2);
        let fill: serde_json::Value = serde_json::from_slice(&calls[0].payloads[0]).unwrap();
        assert_eq!(fill[0]["value"], serde_json::json!([0x40, 0x00]));
        assert_eq!(fill[1]["value"], serde_json::json!([1, 2]));
        let commit: serde_json::Value = serde_json::from_slice(&calls[1].payloads[0]).unwrap();
        assert_eq!(commit[0]["value"], serde_json::json!([0x01]));
    }

    #[test]
    fn test_fill_reply_length_mismatch() {
        let mut fx = Fixture::new();
        let page = FlashPage::new(1, 0);
        fx.queue_acks(1);
        assert!(matches!(
            fill_page(&mut fx.ctx(), &page),
            Err(ExchangeError::Protocol(CodecError::ReplyLength {
                expected: 2,
                actual: 1
            }))
        ));
    }

    #[test]
    fn test_transport_error_propagates() {
        let mut fx = Fixture::new();
        fx.transport.queue_error(TransportError::Closed);
        assert!(matches!(
            reboot(&mut fx.ctx()),
            Err(ExchangeError::Transport(TransportError::Closed))
        ));
        assert_eq!(fx.state.phase, UpdatePhase::Reboot);
    }
}

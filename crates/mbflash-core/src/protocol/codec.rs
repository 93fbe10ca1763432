//! Request codec: maps pages and lifecycle actions to request batches and
//! checks the replies that come back.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, trace};

use super::frame::{ReplyFrame, RequestFrame, SlaveId};
use super::register_map::{ControlFlag, Endianness, ProtocolRevision, RegisterMap, ReplyConvention};
use crate::page::FlashPage;
use crate::transport::{Endpoint, RpcTransport, TransportError};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("reply holds {actual} elements for a batch of {expected}")]
    ReplyLength { expected: usize, actual: usize },

    #[error("reply from slave {actual}, expected slave {expected}")]
    SlaveMismatch { expected: u8, actual: u8 },

    #[error("reply element {index} carries no value")]
    MissingValue { index: usize },

    #[error("reply element {index} carries {actual} values, expected {expected}")]
    ValueLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("transport returned {actual} payloads, expected {expected}")]
    PayloadCount { expected: usize, actual: usize },

    #[error("status signature {actual:?} does not match {expected:?}")]
    StatusSignature { expected: String, actual: String },

    #[error("malformed reply payload: {0}")]
    MalformedReply(#[source] serde_json::Error),

    #[error("device progress counter is {actual}, expected {expected}")]
    CounterMismatch { expected: usize, actual: u16 },

    #[error("request batch is empty")]
    EmptyBatch,

    #[error("revision has no {0} flag")]
    UnsupportedFlag(ControlFlag),

    #[error("failed to encode request batch: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("value {value} does not fit {width} byte(s)")]
    Range { value: i64, width: u8 },
}

impl CodecError {
    /// Whether this is a decoded value exceeding its declared width rather
    /// than a protocol state violation.
    pub fn is_range(&self) -> bool {
        matches!(self, CodecError::Range { .. })
    }
}

/// Failure of one request/reply round trip.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error(transparent)]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Revision-aware encoder/decoder for register operations.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    map: RegisterMap,
    reply: ReplyConvention,
    page_write_timeout_ms: u32,
    control_timeout_ms: Option<u32>,
}

impl RequestCodec {
    pub fn new(revision: &ProtocolRevision) -> Self {
        Self {
            map: revision.register_map.clone(),
            reply: revision.reply.clone(),
            page_write_timeout_ms: revision.page_write_timeout_ms,
            control_timeout_ms: revision.control_timeout_ms,
        }
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Set the page address, then write the page payload.
    pub fn encode_fill_page(&self, slave: SlaveId, page: &FlashPage) -> Vec<RequestFrame> {
        let mut address = [0u8; 2];
        match self.map.page_address_order {
            Endianness::Little => LittleEndian::write_u16(&mut address, page.base()),
            Endianness::Big => BigEndian::write_u16(&mut address, page.base()),
        }

        vec![
            RequestFrame::write(
                slave,
                self.map.write_function,
                self.map.page_address_register(),
                address.to_vec(),
            ),
            RequestFrame::write(
                slave,
                self.map.write_function,
                self.map.page_data_register(),
                page.data().to_vec(),
            )
            .with_timeout(Some(self.page_write_timeout_ms)),
        ]
    }

    /// Write one flag bitmask to the control register.
    pub fn encode_control(
        &self,
        slave: SlaveId,
        flag: ControlFlag,
    ) -> Result<Vec<RequestFrame>, CodecError> {
        let mask = self
            .map
            .flags
            .mask(flag)
            .ok_or(CodecError::UnsupportedFlag(flag))?;

        Ok(vec![
            RequestFrame::write(
                slave,
                self.map.write_function,
                self.map.control_register(),
                vec![mask],
            )
            .with_timeout(self.control_timeout_ms),
        ])
    }

    pub fn encode_read_progress(&self, slave: SlaveId) -> Vec<RequestFrame> {
        vec![RequestFrame::read(
            slave,
            self.map.read_function,
            self.map.progress_register(),
            u16::from(self.map.progress_width),
        )]
    }

    /// Assemble the progress counter from a validated read reply.
    ///
    /// Every element is one register byte; bytes are little-endian.
    pub fn decode_progress(&self, replies: &[ReplyFrame]) -> Result<u16, CodecError> {
        let width = usize::from(self.map.progress_width);
        let [reply] = replies else {
            return Err(CodecError::ReplyLength {
                expected: 1,
                actual: replies.len(),
            });
        };
        let value = reply
            .value
            .as_deref()
            .ok_or(CodecError::MissingValue { index: 0 })?;
        if value.len() != width {
            return Err(CodecError::ValueLength {
                index: 0,
                expected: width,
                actual: value.len(),
            });
        }

        let mut bytes = [0u8; 2];
        for (slot, &element) in bytes.iter_mut().zip(value) {
            *slot = u8::try_from(element).map_err(|_| CodecError::Range {
                value: element,
                width: 1,
            })?;
        }
        Ok(LittleEndian::read_u16(&bytes))
    }

    /// Check a reply batch against the request batch it answers.
    pub fn validate_reply(request: &[RequestFrame], reply: &[ReplyFrame]) -> Result<(), CodecError> {
        let first = request.first().ok_or(CodecError::EmptyBatch)?;
        if reply.len() != request.len() {
            return Err(CodecError::ReplyLength {
                expected: request.len(),
                actual: reply.len(),
            });
        }
        if reply[0].slave != first.slave.get() {
            return Err(CodecError::SlaveMismatch {
                expected: first.slave.get(),
                actual: reply[0].slave,
            });
        }

        for (index, (req, rep)) in request.iter().zip(reply).enumerate() {
            if !req.function.is_read() {
                continue;
            }
            let value = rep
                .value
                .as_ref()
                .ok_or(CodecError::MissingValue { index })?;
            if value.len() != usize::from(req.count) {
                return Err(CodecError::ValueLength {
                    index,
                    expected: usize::from(req.count),
                    actual: value.len(),
                });
            }
        }
        Ok(())
    }

    /// Serialize a batch into the single payload the transport carries.
    pub fn encode_payloads(&self, batch: &[RequestFrame]) -> Result<Vec<Vec<u8>>, CodecError> {
        if batch.is_empty() {
            return Err(CodecError::EmptyBatch);
        }
        let payload = serde_json::to_vec(batch).map_err(CodecError::Encode)?;
        Ok(vec![payload])
    }

    /// Strip the reply envelope of this revision and parse the frames.
    pub fn decode_reply(&self, payloads: &[Vec<u8>]) -> Result<Vec<ReplyFrame>, CodecError> {
        let body = match &self.reply {
            ReplyConvention::Bare => match payloads {
                [body] => body,
                _ => {
                    return Err(CodecError::PayloadCount {
                        expected: 1,
                        actual: payloads.len(),
                    });
                }
            },
            ReplyConvention::StatusPrefixed { success } => match payloads {
                [status, body] => {
                    if status.as_slice() != success.as_bytes() {
                        return Err(CodecError::StatusSignature {
                            expected: success.clone(),
                            actual: String::from_utf8_lossy(status).into_owned(),
                        });
                    }
                    body
                }
                _ => {
                    return Err(CodecError::PayloadCount {
                        expected: 2,
                        actual: payloads.len(),
                    });
                }
            },
        };

        serde_json::from_slice(body).map_err(CodecError::MalformedReply)
    }

    /// Encode, call, decode and validate one batch.
    pub fn exchange<T: RpcTransport + ?Sized>(
        &self,
        transport: &T,
        endpoint: &Endpoint,
        batch: &[RequestFrame],
    ) -> Result<Vec<ReplyFrame>, ExchangeError> {
        let payloads = self.encode_payloads(batch)?;
        trace!(frames = batch.len(), "Sending request batch");

        let reply_payloads = transport.call(endpoint, payloads)?;
        let reply = self.decode_reply(&reply_payloads)?;
        Self::validate_reply(batch, &reply)?;

        debug!(
            frames = batch.len(),
            addr = %format!("0x{:04X}", batch[0].address),
            "Batch acknowledged"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FunctionCode;
    use crate::transport::MockTransport;

    fn slave() -> SlaveId {
        SlaveId::new(5).unwrap()
    }

    fn full_page(base: u16) -> FlashPage {
        let mut page = FlashPage::new(4, base);
        for (i, byte) in [0xDE, 0xAD, 0xBE, 0xEF].into_iter().enumerate() {
            page.append(u32::from(base) + i as u32, byte).unwrap();
        }
        page
    }

    #[test]
    fn test_fill_page_little_endian() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let frames = codec.encode_fill_page(slave(), &full_page(0x1280));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address, 0x2003);
        assert_eq!(frames[0].value, Some(vec![0x80, 0x12]));
        assert_eq!(frames[0].count, 2);
        assert_eq!(frames[0].timeout_ms, None);
        assert_eq!(frames[1].address, 0x2005);
        assert_eq!(frames[1].value, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(frames[1].count, 4);
        assert_eq!(frames[1].timeout_ms, Some(1000));
        assert!(frames.iter().all(|f| f.function == FunctionCode::WriteBytes));
    }

    #[test]
    fn test_fill_page_big_endian() {
        let codec = RequestCodec::new(&ProtocolRevision::v1());
        let frames = codec.encode_fill_page(slave(), &full_page(0x1280));
        assert_eq!(frames[0].value, Some(vec![0x12, 0x80]));
    }

    #[test]
    fn test_control_frames() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let frames = codec.encode_control(slave(), ControlFlag::Reboot).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].address, 0x2000);
        assert_eq!(frames[0].value, Some(vec![0x80]));
        assert_eq!(frames[0].count, 1);

        let mut revision = ProtocolRevision::v2();
        revision.register_map.flags.eeprom_update = None;
        let codec = RequestCodec::new(&revision);
        assert!(matches!(
            codec.encode_control(slave(), ControlFlag::EepromUpdate),
            Err(CodecError::UnsupportedFlag(ControlFlag::EepromUpdate))
        ));
    }

    #[test]
    fn test_read_progress_width() {
        let v2 = RequestCodec::new(&ProtocolRevision::v2()).encode_read_progress(slave());
        assert_eq!((v2[0].address, v2[0].count), (0x2002, 1));
        assert_eq!(v2[0].function, FunctionCode::ReadBytes);

        let v1 = RequestCodec::new(&ProtocolRevision::v1()).encode_read_progress(slave());
        assert_eq!((v1[0].address, v1[0].count), (0x2001, 2));
    }

    fn progress_reply(value: Vec<i64>) -> Vec<ReplyFrame> {
        vec![ReplyFrame {
            slave: 5,
            function: None,
            address: None,
            count: None,
            value: Some(value),
        }]
    }

    #[test]
    fn test_decode_progress() {
        let v2 = RequestCodec::new(&ProtocolRevision::v2());
        assert_eq!(v2.decode_progress(&progress_reply(vec![7])).unwrap(), 7);

        let v1 = RequestCodec::new(&ProtocolRevision::v1());
        assert_eq!(v1.decode_progress(&progress_reply(vec![0x34, 0x12])).unwrap(), 0x1234);
    }

    #[test]
    fn test_decode_progress_out_of_range() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let err = codec.decode_progress(&progress_reply(vec![256])).unwrap_err();
        assert!(err.is_range());
        let err = codec.decode_progress(&progress_reply(vec![-1])).unwrap_err();
        assert!(err.is_range());
        let err = codec.decode_progress(&progress_reply(vec![1, 0])).unwrap_err();
        assert!(matches!(err, CodecError::ValueLength { .. }));
        assert!(!err.is_range());
    }

    #[test]
    fn test_validate_reply_shape() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let request = codec.encode_fill_page(slave(), &full_page(0));
        let ok: Vec<ReplyFrame> = request.iter().map(ReplyFrame::echo).collect();
        RequestCodec::validate_reply(&request, &ok).unwrap();

        assert!(matches!(
            RequestCodec::validate_reply(&request, &ok[..1]),
            Err(CodecError::ReplyLength {
                expected: 2,
                actual: 1
            })
        ));

        let mut wrong_slave = ok.clone();
        wrong_slave[0].slave = 6;
        assert!(matches!(
            RequestCodec::validate_reply(&request, &wrong_slave),
            Err(CodecError::SlaveMismatch {
                expected: 5,
                actual: 6
            })
        ));

        assert!(matches!(
            RequestCodec::validate_reply(&[], &[]),
            Err(CodecError::EmptyBatch)
        ));
    }

    #[test]
    fn test_validate_read_reply_requires_value() {
        let codec = RequestCodec::new(&ProtocolRevision::v1());
        let request = codec.encode_read_progress(slave());
        let echo = vec![ReplyFrame::echo(&request[0])];
        assert!(matches!(
            RequestCodec::validate_reply(&request, &echo),
            Err(CodecError::MissingValue { index: 0 })
        ));

        let short = vec![ReplyFrame::echo(&request[0]).with_value(vec![1])];
        assert!(matches!(
            RequestCodec::validate_reply(&request, &short),
            Err(CodecError::ValueLength {
                index: 0,
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_encode_payloads_single_json_array() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let batch = codec.encode_read_progress(slave());
        let payloads = codec.encode_payloads(&batch).unwrap();
        assert_eq!(payloads.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"slave": 5, "fcode": 65, "addr": 0x2002, "count": 1}])
        );
        assert!(matches!(codec.encode_payloads(&[]), Err(CodecError::EmptyBatch)));
    }

    #[test]
    fn test_decode_reply_conventions() {
        let body = br#"[{"slave": 5}]"#.to_vec();

        let v2 = RequestCodec::new(&ProtocolRevision::v2());
        let reply = v2.decode_reply(&[b"OK".to_vec(), body.clone()]).unwrap();
        assert_eq!(reply[0].slave, 5);
        assert!(matches!(
            v2.decode_reply(&[b"ERR".to_vec(), body.clone()]),
            Err(CodecError::StatusSignature { .. })
        ));
        assert!(matches!(
            v2.decode_reply(&[body.clone()]),
            Err(CodecError::PayloadCount {
                expected: 2,
                actual: 1
            })
        ));

        let v1 = RequestCodec::new(&ProtocolRevision::v1());
        assert_eq!(v1.decode_reply(&[body.clone()]).unwrap().len(), 1);
        assert!(matches!(
            v1.decode_reply(&[b"{\"slave\": 5}".to_vec()]),
            Err(CodecError::MalformedReply(_))
        ));
    }

    #[test]
    fn test_exchange_through_mock() {
        let codec = RequestCodec::new(&ProtocolRevision::v2());
        let transport = MockTransport::new();
        let endpoint = Endpoint::new("tcp://localhost:5555", "rtu");
        let batch = codec.encode_read_progress(slave());

        transport.queue_frames(Some("OK"), &[ReplyFrame::echo(&batch[0]).with_value(vec![3])]);
        let reply = codec.exchange(&transport, &endpoint, &batch).unwrap();
        assert_eq!(codec.decode_progress(&reply).unwrap(), 3);

        let calls = transport.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, endpoint);

        let err = codec.exchange(&transport, &endpoint, &batch).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Transport(TransportError::Timeout { .. })
        ));
    }
}

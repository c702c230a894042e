use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Fixed record size of a serial/TCP CAN gateway: info byte, 4-byte id, 8 data bytes.
pub const RECORD_LEN: usize = 13;

const EXTENDED_FLAG: u8 = 0x80;
const REMOTE_FLAG: u8 = 0x40;
const DLC_MASK: u8 = 0x0F;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawFrame {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Splits the gateway's transparent-mode byte stream into frames. Remote
/// frames carry no payload and are skipped.
#[derive(Debug, Default)]
pub struct GatewayCodec;

impl Decoder for GatewayCodec {
    type Item = RawFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.len() >= RECORD_LEN {
            let info = src.get_u8();
            let raw_id = src.get_u32();
            let mut data = [0u8; 8];
            src.copy_to_slice(&mut data);

            if info & REMOTE_FLAG != 0 {
                continue;
            }

            let id = if info & EXTENDED_FLAG != 0 {
                raw_id & 0x1FFF_FFFF
            } else {
                raw_id & 0x7FF
            };
            let len = ((info & DLC_MASK) as usize).min(data.len());

            return Ok(Some(RawFrame {
                id,
                data: data[..len].to_vec(),
            }));
        }

        Ok(None)
    }
}

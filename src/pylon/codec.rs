use crate::pylon::frame::{EOI, MAX_INFO_CHARS, MIN_FRAME_LEN, SOI};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest frame the wire can carry.
const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_INFO_CHARS;

/// Splits a half-duplex byte stream into raw `~...\r` frames. Frame contents
/// are not checked here; `frame::decode` does that so a corrupt frame is
/// reported without tearing down the stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|b| *b == SOI) {
                Some(start) => src.advance(start),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            // a second start marker before the terminator means the first
            // frame was cut off; resync on the newer one
            match src.iter().skip(1).position(|b| *b == EOI || *b == SOI) {
                Some(i) if src[i + 1] == SOI => {
                    src.advance(i + 1);
                    continue;
                }
                Some(i) => return Ok(Some(src.split_to(i + 2).to_vec())),
                None if src.len() > MAX_FRAME_LEN => {
                    src.advance(1);
                    continue;
                }
                None => return Ok(None),
            }
        }
    }
}

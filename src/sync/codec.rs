use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest head frame we accept or send.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frames encoded entries on a heads exchange stream: a `u32` big endian length followed by
/// the entry bytes.
#[derive(Debug, Default)]
pub(crate) struct HeadsCodec;

impl Decoder for HeadsCodec {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        ensure!(
            frame_len <= MAX_MESSAGE_SIZE,
            "received head that is too large: {}",
            frame_len
        );
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for HeadsCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        ensure!(
            item.len() <= MAX_MESSAGE_SIZE,
            "attempting to send head that is too large {}",
            item.len()
        );
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

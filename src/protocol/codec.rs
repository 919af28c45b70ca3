//! Length-delimited postcard framing for [`Message`]
//!
//! Every frame is a 4-byte big-endian length followed by the postcard body.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::messages::Message;

/// Largest frame accepted from a peer (1 MiB)
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

fn new_length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec()
}

/// Wraps [`LengthDelimitedCodec`] with postcard encoding of [`Message`]
///
/// Malformed bodies and unknown tags surface as `InvalidData` I/O errors.
#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl MessageCodec {
    /// Creates a codec with the 1 MiB frame limit
    pub fn new() -> Self { Self { inner: new_length_delimited_codec() } }
}

impl Default for MessageCodec {
    fn default() -> Self { Self::new() }
}

impl Clone for MessageCodec {
    fn clone(&self) -> Self { Self::new() }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let message = postcard::from_bytes(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

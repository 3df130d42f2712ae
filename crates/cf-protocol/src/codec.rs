//! Tokio codec for framed tunnel messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel this frame belongs to
    pub channel_id: ChannelId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    pub fn new(channel_id: ChannelId, message: Message) -> Self {
        Self {
            channel_id,
            message,
        }
    }

    /// A frame on the control channel
    pub fn control(message: Message) -> Self {
        Self::new(ChannelId::CONTROL, message)
    }
}

/// Codec for encoding/decoding tunnel frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header already consumed while waiting for the rest of its payload
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload)?;

        let actual = message.message_type();
        if actual != header.message_type {
            tracing::warn!(
                channel = %header.channel_id,
                header = ?header.message_type,
                payload = ?actual,
                "Frame header disagrees with its payload"
            );
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: actual,
            });
        }

        Ok(Some(Frame {
            channel_id: header.channel_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(
            frame.channel_id,
            frame.message.message_type(),
            payload.len() as u32,
        );
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

//! Relay frame model
//!
//! The wire codec belongs to tokio-tungstenite. The relay only looks at a
//! frame as an opcode, a payload and an optional masking key, and dispatches
//! on the opcode with an exhaustive match.

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::Message;

/// Errors raised while turning a transport message into a relay frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unsupported opcode: {0}")]
    UnsupportedOpcode(String),

    #[error("Text payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Ping,
    Pong,
    Close,
}

/// One unit of the relay protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    /// Masking key, present while the payload is still masked
    pub mask: Option<[u8; 4]>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            mask: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    pub fn close() -> Self {
        Self::new(Opcode::Close, Vec::new())
    }

    /// Mask the payload with `key`, the way a client puts it on the wire
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.unmask();
        apply_mask(&mut self.payload, key);
        self.mask = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Remove the mask in place. No-op for unmasked frames.
    pub fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            apply_mask(&mut self.payload, key);
        }
    }

    /// Unmask and decode the payload as UTF-8 text
    pub fn into_text(mut self) -> Result<String, FrameError> {
        self.unmask();
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Convert a transport message into a relay frame
    ///
    /// Raw frames keep their masking key so the caller decides when to
    /// unmask; decoded messages are already clear text.
    pub fn from_message(message: Message) -> Result<Self, FrameError> {
        match message {
            Message::Text(text) => Ok(Self::text(text)),
            Message::Ping(data) => Ok(Self::ping(data)),
            Message::Pong(data) => Ok(Self::pong(data)),
            Message::Close(close) => {
                let payload = match close {
                    Some(close) => {
                        let mut payload = u16::from(close.code).to_be_bytes().to_vec();
                        payload.extend_from_slice(close.reason.as_bytes());
                        payload
                    }
                    None => Vec::new(),
                };
                Ok(Self::new(Opcode::Close, payload))
            }
            Message::Binary(_) => Err(FrameError::UnsupportedOpcode("binary".to_string())),
            Message::Frame(raw) => {
                let header = raw.header();
                let opcode = match header.opcode {
                    OpCode::Data(Data::Text) => Opcode::Text,
                    OpCode::Control(Control::Ping) => Opcode::Ping,
                    OpCode::Control(Control::Pong) => Opcode::Pong,
                    OpCode::Control(Control::Close) => Opcode::Close,
                    other => return Err(FrameError::UnsupportedOpcode(format!("{:?}", other))),
                };
                Ok(Self {
                    opcode,
                    mask: header.mask,
                    payload: raw.payload().to_vec(),
                })
            }
        }
    }

    /// Convert into a transport message, unmasking first
    pub fn into_message(mut self) -> Message {
        self.unmask();
        match self.opcode {
            Opcode::Text => Message::Text(String::from_utf8_lossy(&self.payload).into_owned()),
            Opcode::Ping => Message::Ping(self.payload),
            Opcode::Pong => Message::Pong(self.payload),
            Opcode::Close => Message::Close(None),
        }
    }
}

/// XOR `buf` with the 4-byte masking key (RFC 6455 section 5.3)
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::Frame as RawFrame;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_unmask_restores_payload() {
        let mut frame = Frame::text("Hello").masked(KEY);
        assert!(frame.is_masked());
        assert_ne!(frame.payload, b"Hello");

        frame.unmask();
        assert!(!frame.is_masked());
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_unmask_rfc_sample() {
        // RFC 6455 section 5.7, masked "Hello"
        let mut frame = Frame {
            opcode: Opcode::Text,
            payload: vec![0x7f, 0x9f, 0x4d, 0x51, 0x58],
            mask: Some(KEY),
        };
        frame.unmask();
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_unmask_unmasked_is_noop() {
        let mut frame = Frame::text("plain");
        frame.unmask();
        assert_eq!(frame.payload, b"plain");
    }

    #[test]
    fn test_into_text_unmasks() {
        let frame = Frame::text("hi there").masked(KEY);
        assert_eq!(frame.into_text().unwrap(), "hi there");
    }

    #[test]
    fn test_into_text_invalid_utf8() {
        let frame = Frame::new(Opcode::Text, vec![0xff, 0xfe]);
        assert_eq!(frame.into_text(), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_from_message_opcodes() {
        let frame = Frame::from_message(Message::Text("hi".to_string())).unwrap();
        assert_eq!(frame, Frame::text("hi"));

        let frame = Frame::from_message(Message::Ping(vec![1, 2])).unwrap();
        assert_eq!(frame.opcode, Opcode::Ping);
        assert_eq!(frame.payload, vec![1, 2]);

        let frame = Frame::from_message(Message::Pong(vec![])).unwrap();
        assert_eq!(frame.opcode, Opcode::Pong);

        let frame = Frame::from_message(Message::Close(None)).unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
    }

    #[test]
    fn test_from_message_binary_unsupported() {
        let result = Frame::from_message(Message::Binary(vec![1, 2, 3]));
        assert!(matches!(result, Err(FrameError::UnsupportedOpcode(_))));
    }

    #[test]
    fn test_from_raw_masked_frame() {
        let mut payload = b"hi".to_vec();
        apply_mask(&mut payload, KEY);
        let mut raw = RawFrame::message(payload, OpCode::Data(Data::Text), true);
        raw.header_mut().mask = Some(KEY);

        let frame = Frame::from_message(Message::Frame(raw)).unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.is_masked());
        assert_eq!(frame.into_text().unwrap(), "hi");
    }

    #[test]
    fn test_from_raw_binary_unsupported() {
        let raw = RawFrame::message(vec![0u8; 4], OpCode::Data(Data::Binary), true);
        let result = Frame::from_message(Message::Frame(raw));
        assert!(matches!(result, Err(FrameError::UnsupportedOpcode(_))));
    }

    #[test]
    fn test_into_message() {
        assert_eq!(
            Frame::text("x").masked(KEY).into_message(),
            Message::Text("x".to_string())
        );
        assert_eq!(Frame::pong(vec![9]).into_message(), Message::Pong(vec![9]));
        assert_eq!(Frame::close().into_message(), Message::Close(None));
    }
}

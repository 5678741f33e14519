//! Reassembly of data frames into application messages.

use crate::errors::ProtocolError;
use crate::frame::{Frame, Opcode};

/// Kind of data message, fixed by its first frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Partial {
    kind: MessageKind,
    payload: Vec<u8>,
}

/// Per-connection fragmentation state.
///
/// At most one message is in progress at a time. Control frames are not
/// accepted here; the caller handles them without touching this state.
pub struct MessageAssembler {
    partial: Option<Partial>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: None,
            max_message_size,
        }
    }

    /// Kind of the message currently being accumulated, if any.
    pub fn in_progress(&self) -> Option<MessageKind> {
        self.partial.as_ref().map(|p| p.kind)
    }

    /// Feed one data frame. Returns the message once its final frame arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let Frame {
            fin,
            opcode,
            payload,
            ..
        } = frame;

        match (opcode, self.in_progress()) {
            (Opcode::Text | Opcode::Binary, None) => {
                let kind = if opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                self.check_size(payload.len())?;
                if fin {
                    return finish(kind, payload).map(Some);
                }
                self.partial = Some(Partial { kind, payload });
                Ok(None)
            }
            (Opcode::Continuation, Some(_)) => {
                let Some(mut partial) = self.partial.take() else {
                    return Err(ProtocolError::UnexpectedContinuation);
                };
                self.check_size(partial.payload.len().saturating_add(payload.len()))?;
                partial.payload.extend_from_slice(&payload);
                if fin {
                    return finish(partial.kind, partial.payload).map(Some);
                }
                self.partial = Some(partial);
                Ok(None)
            }
            (Opcode::Continuation, None) => Err(ProtocolError::UnexpectedContinuation),
            (Opcode::Text | Opcode::Binary, Some(in_progress)) => {
                Err(ProtocolError::MessageInProgress {
                    opcode,
                    in_progress,
                })
            }
            (control, _) => Err(ProtocolError::NotADataFrame(control)),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

fn finish(kind: MessageKind, payload: Vec<u8>) -> Result<Message, ProtocolError> {
    match kind {
        MessageKind::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| ProtocolError::InvalidUtf8),
        MessageKind::Binary => Ok(Message::Binary(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(opcode: Opcode, payload: &str, fin: bool) -> Frame {
        Frame::new(opcode, payload, fin)
    }

    #[test]
    fn single_frame_text() {
        let mut asm = MessageAssembler::default();
        let msg = asm.push(data(Opcode::Text, "hi", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("hi".into())));
        assert_eq!(asm.in_progress(), None);
    }

    #[test]
    fn fragmented_text_reassembles() {
        let mut asm = MessageAssembler::default();
        assert_eq!(asm.push(data(Opcode::Text, "He", false)).unwrap(), None);
        assert_eq!(asm.in_progress(), Some(MessageKind::Text));
        assert_eq!(asm.push(data(Opcode::Continuation, "llo ", false)).unwrap(), None);
        let msg = asm.push(data(Opcode::Continuation, "World", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("Hello World".into())));
        assert_eq!(asm.in_progress(), None);
    }

    #[test]
    fn fragmented_binary_reassembles() {
        let mut asm = MessageAssembler::default();
        asm.push(Frame::new(Opcode::Binary, vec![1, 2], false)).unwrap();
        let msg = asm
            .push(Frame::new(Opcode::Continuation, vec![3], true))
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Binary(vec![1, 2, 3]));
        assert_eq!(msg.kind(), MessageKind::Binary);
        assert_eq!(msg.len(), 3);
    }

    #[test]
    fn continuation_without_start_rejected() {
        let mut asm = MessageAssembler::default();
        assert_eq!(
            asm.push(data(Opcode::Continuation, "x", true)),
            Err(ProtocolError::UnexpectedContinuation)
        );
    }

    #[test]
    fn new_data_frame_mid_message_rejected() {
        let mut asm = MessageAssembler::default();
        asm.push(data(Opcode::Text, "a", false)).unwrap();
        assert_eq!(
            asm.push(data(Opcode::Binary, "b", true)),
            Err(ProtocolError::MessageInProgress {
                opcode: Opcode::Binary,
                in_progress: MessageKind::Text,
            })
        );
    }

    #[test]
    fn control_frames_not_accepted() {
        let mut asm = MessageAssembler::default();
        asm.push(data(Opcode::Text, "a", false)).unwrap();
        assert_eq!(
            asm.push(data(Opcode::Ping, "", true)),
            Err(ProtocolError::NotADataFrame(Opcode::Ping))
        );
        // In-progress state untouched.
        assert_eq!(asm.in_progress(), Some(MessageKind::Text));
        let msg = asm.push(data(Opcode::Continuation, "b", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("ab".into())));
    }

    #[test]
    fn invalid_utf8_rejected_on_completion() {
        let mut asm = MessageAssembler::default();
        asm.push(Frame::new(Opcode::Text, vec![0xE2, 0x82], false)).unwrap();
        assert_eq!(
            asm.push(Frame::new(Opcode::Continuation, vec![0xFF], true)),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn utf8_split_across_fragments_is_fine() {
        let euro = "€".as_bytes();
        let mut asm = MessageAssembler::default();
        asm.push(Frame::new(Opcode::Text, euro[..1].to_vec(), false)).unwrap();
        let msg = asm
            .push(Frame::new(Opcode::Continuation, euro[1..].to_vec(), true))
            .unwrap();
        assert_eq!(msg, Some(Message::Text("€".into())));
    }

    #[test]
    fn message_size_limit() {
        let mut asm = MessageAssembler::new(4);
        asm.push(data(Opcode::Binary, "abc", false)).unwrap();
        assert_eq!(
            asm.push(data(Opcode::Continuation, "de", true)),
            Err(ProtocolError::MessageTooLarge { size: 5, limit: 4 })
        );

        let mut asm = MessageAssembler::new(4);
        assert!(matches!(
            asm.push(data(Opcode::Text, "hello", true)),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn empty_message() {
        let mut asm = MessageAssembler::default();
        let msg = asm.push(data(Opcode::Binary, "", true)).unwrap().unwrap();
        assert!(msg.is_empty());
    }
}

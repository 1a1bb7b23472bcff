use anyhow::{anyhow, bail};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::protocol::WireCodec;
use crate::codec::value::{Parameters, Value};
use crate::crypto::PayloadEncryption;

/// first byte of every application level message
pub const MESSAGE_MAGIC: u8 = 0xF3;
/// alternative magic byte that some servers use for the same message format
pub const MESSAGE_MAGIC_ALT: u8 = 0xFD;
/// set in the message type byte if the message body is encrypted
pub const ENCRYPTED_FLAG: u8 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Init = 0,
    InitResponse = 1,
    Operation = 2,
    OperationResponse = 3,
    Event = 4,
    InternalOperationRequest = 6,
    InternalOperationResponse = 7,
    Message = 8,
    RawMessage = 9,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationRequest {
    pub operation_code: u8,
    pub parameters: Parameters,
}
impl OperationRequest {
    pub fn new(operation_code: u8) -> OperationRequest {
        OperationRequest {
            operation_code,
            parameters: Default::default(),
        }
    }

    pub fn with_parameter(mut self, key: u8, value: impl Into<Value>) -> OperationRequest {
        self.parameters.insert(key, value.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationResponse {
    pub operation_code: u8,
    pub return_code: i16,
    pub debug_message: Option<String>,
    pub parameters: Parameters,
}
impl OperationResponse {
    pub fn get(&self, key: u8) -> Option<&Value> {
        self.parameters.get(&key)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventData {
    pub code: u8,
    pub parameters: Parameters,
}
impl EventData {
    pub fn get(&self, key: u8) -> Option<&Value> {
        self.parameters.get(&key)
    }
}

/// An application level message, i.e. the payload of a send command or the body of a TCP frame.
///  On the wire it is `[magic, message type (| 0x80 if encrypted), body..]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    InitResponse,
    Operation(OperationRequest),
    OperationResponse(OperationResponse),
    Event(EventData),
    InternalOperationRequest(OperationRequest),
    InternalOperationResponse(OperationResponse),
    /// arbitrary codec value
    Message(Value),
    /// opaque bytes, sent as a tagged byte array
    RawMessage(Vec<u8>),
}
impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::InitResponse => MessageType::InitResponse,
            Envelope::Operation(_) => MessageType::Operation,
            Envelope::OperationResponse(_) => MessageType::OperationResponse,
            Envelope::Event(_) => MessageType::Event,
            Envelope::InternalOperationRequest(_) => MessageType::InternalOperationRequest,
            Envelope::InternalOperationResponse(_) => MessageType::InternalOperationResponse,
            Envelope::Message(_) => MessageType::Message,
            Envelope::RawMessage(_) => MessageType::RawMessage,
        }
    }
}

impl WireCodec {
    /// Serializes a message including its two header bytes. If `encryption` is passed, the body
    ///  is replaced by its ciphertext and the message type is flagged accordingly.
    pub fn ser_message(&self, envelope: &Envelope, encryption: Option<&dyn PayloadEncryption>) -> anyhow::Result<Vec<u8>> {
        let mut body = BytesMut::new();
        match envelope {
            Envelope::InitResponse => {}
            Envelope::Operation(request) | Envelope::InternalOperationRequest(request) => self.ser_operation_request(request, &mut body)?,
            Envelope::OperationResponse(response) | Envelope::InternalOperationResponse(response) => self.ser_operation_response(response, &mut body)?,
            Envelope::Event(event) => self.ser_event(event, &mut body)?,
            Envelope::Message(value) => self.ser_value(value, &mut body)?,
            Envelope::RawMessage(bytes) => self.ser_value(&Value::ByteArray(bytes.clone()), &mut body)?,
        }

        let message_type: u8 = envelope.message_type().into();
        let mut result = Vec::with_capacity(body.len() + 2);
        result.push(MESSAGE_MAGIC);
        match encryption {
            Some(encryption) if !body.is_empty() => {
                result.push(message_type | ENCRYPTED_FLAG);
                result.extend_from_slice(&encryption.encrypt(&body)?);
            }
            _ => {
                result.push(message_type);
                result.extend_from_slice(&body);
            }
        }
        Ok(result)
    }

    pub fn try_deser_message(&self, buf: &[u8], encryption: Option<&dyn PayloadEncryption>) -> anyhow::Result<Envelope> {
        if buf.len() < 2 {
            bail!("message of {} bytes is too short", buf.len());
        }
        if buf[0] != MESSAGE_MAGIC && buf[0] != MESSAGE_MAGIC_ALT {
            bail!("invalid message magic byte {:#x}", buf[0]);
        }

        let is_encrypted = buf[1] & ENCRYPTED_FLAG != 0;
        let message_type = MessageType::try_from(buf[1] & !ENCRYPTED_FLAG)
            .map_err(|_| anyhow!("invalid message type discriminator {}", buf[1] & !ENCRYPTED_FLAG))?;

        if message_type == MessageType::InitResponse {
            return Ok(Envelope::InitResponse);
        }

        let decrypted;
        let mut body = if is_encrypted {
            let encryption = encryption
                .ok_or_else(|| anyhow!("received an encrypted message before encryption was established"))?;
            decrypted = encryption.decrypt(&buf[2..])?;
            decrypted.as_slice()
        }
        else {
            &buf[2..]
        };

        let envelope = match message_type {
            MessageType::Operation => Envelope::Operation(self.try_deser_operation_request(&mut body)?),
            MessageType::InternalOperationRequest => Envelope::InternalOperationRequest(self.try_deser_operation_request(&mut body)?),
            MessageType::OperationResponse => Envelope::OperationResponse(self.try_deser_operation_response(&mut body)?),
            MessageType::InternalOperationResponse => Envelope::InternalOperationResponse(self.try_deser_operation_response(&mut body)?),
            MessageType::Event => Envelope::Event(self.try_deser_event(&mut body)?),
            MessageType::Message => Envelope::Message(self.try_deser_value(&mut body)?),
            MessageType::RawMessage => match self.try_deser_value(&mut body)? {
                Value::ByteArray(bytes) => Envelope::RawMessage(bytes),
                other => bail!("raw message with non-binary content {:?}", other),
            },
            MessageType::Init | MessageType::InitResponse => bail!("unexpected message type {:?}", message_type),
        };
        Ok(envelope)
    }
}

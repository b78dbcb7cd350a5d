//! The built-in control protocol (`service_id` 0). Mirrors
//! `runtime/control.c`: the server side exposes `subscribe`/`unsubscribe`
//! actions that flip a bit in a client's subscription bitmap, and the client
//! side exposes a single `error` event the server raises when an invocation
//! it received could not be dispatched or answered.

pub const CONTROL_SERVICE_ID: u8 = 0;

pub const ACTION_SUBSCRIBE: u8 = 0;
pub const ACTION_UNSUBSCRIBE: u8 = 1;
pub const ACTION_ERROR_EVENT: u8 = 2;

/// Payload of a `subscribe`/`unsubscribe` invocation: the `service_id` the
/// caller wants to start or stop receiving events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub service_id: u8,
}

impl SubscriptionRequest {
    pub const WIRE_SIZE: usize = 1;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        [self.service_id]
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        payload.first().map(|&service_id| Self { service_id })
    }
}

/// Payload of the control error event: which message the server could not
/// service, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlError {
    pub message_id: u32,
    pub code: i32,
}

impl ControlError {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            message_id: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            code: i32::from_le_bytes(payload[4..8].try_into().unwrap()),
        })
    }
}

//! Established TEE3 session state

use super::handshake::EstablishedHandshake;
use super::protocol::{open_frame, seal_frame, Direction, FrameHeader, SessionKeys};
use crate::domain::Tee3Error;
use std::time::{Duration, Instant};

/// Client side of an established session
#[derive(Debug)]
pub struct Tee3Session {
    cid: String,
    keys: SessionKeys,
    request_counter: u64,
    production: bool,
    established_at: Instant,
    authorized: bool,
}

impl Tee3Session {
    pub fn new(handshake: EstablishedHandshake, production: bool) -> Self {
        Self {
            cid: handshake.cid,
            keys: handshake.keys,
            request_counter: 0,
            production,
            established_at: Instant::now(),
            authorized: false,
        }
    }

    /// Path encrypted requests are posted to
    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.age() >= lifetime
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn mark_authorized(&mut self) {
        self.authorized = true;
    }

    /// Encrypts an inner request, returning the frame and its counter
    pub fn encrypt_request(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, u64), Tee3Error> {
        self.request_counter += 1;
        let header = FrameHeader {
            pu: self.production,
            direction: Direction::Request,
            request_counter: self.request_counter,
            key_id: self.keys.key_id,
        };
        let frame = seal_frame(&self.keys.c2s, &header, plaintext)?;
        Ok((frame, self.request_counter))
    }

    /// Decrypts the response to the request numbered `request_counter`
    pub fn decrypt_response(&self, frame: &[u8], request_counter: u64) -> Result<Vec<u8>, Tee3Error> {
        let (header, plaintext) = open_frame(&self.keys.s2c, frame)?;
        if header.direction != Direction::Response {
            return Err(Tee3Error::Protocol(
                "response frame is flagged as request".to_string(),
            ));
        }
        if header.key_id != self.keys.key_id {
            return Err(Tee3Error::Protocol("response key id mismatch".to_string()));
        }
        if header.request_counter != request_counter {
            return Err(Tee3Error::Protocol(format!(
                "response counter {} does not match request {}",
                header.request_counter, request_counter
            )));
        }
        Ok(plaintext)
    }
}

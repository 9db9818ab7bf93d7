/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::error::{StreamingError, StreamingResult};
use std::time::Duration;

/// Round-robin walk over the candidate endpoints of a connection.
///
/// The first move of every new rotation (after the first one) waits
/// `rotation_number * base_delay`; every other move is immediate.
#[derive(Debug, Clone)]
pub struct EndpointRotation {
    uris: Vec<String>,
    index: usize,
    num_reconnection: u32,
    delay: Duration,
    base_delay: Duration,
}

impl EndpointRotation {
    /// # Errors
    ///
    /// `StreamingError::Resolution` when `uris` is empty.
    pub fn new(uris: Vec<String>, base_delay: Duration) -> StreamingResult<Self> {
        if uris.is_empty() {
            return Err(StreamingError::Resolution(
                "no candidate endpoint to connect to".to_string(),
            ));
        }
        Ok(Self {
            uris,
            index: 0,
            num_reconnection: 0,
            delay: Duration::ZERO,
            base_delay,
        })
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn current_uri(&self) -> &str {
        &self.uris[self.index]
    }

    /// Moves to the next endpoint and computes the delay to wait before using it.
    pub fn next_uri(&mut self) -> &str {
        let count = self.uris.len() as u32;
        self.index = (self.index + 1) % self.uris.len();
        if self.num_reconnection != 0 && self.num_reconnection % count == 0 {
            let multiplier = (self.num_reconnection + 1) / count;
            self.delay = self.base_delay * multiplier;
        } else {
            self.delay = Duration::ZERO;
        }
        self.num_reconnection += 1;
        &self.uris[self.index]
    }

    /// Delay computed by the last call to [`next_uri`](Self::next_uri).
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn reconnections(&self) -> u32 {
        self.num_reconnection
    }

    /// Forgets the back-off progress; the current endpoint is kept.
    pub fn reset(&mut self) {
        self.num_reconnection = 0;
        self.delay = Duration::ZERO;
    }
}

//! Parsing of the session list printed by the remote tool.
//!
//! The list command prints free-form text. Each live session shows up as a
//! fixed marker followed by its display number, e.g.
//! `LIVE session at :17`. Only the marker and the digits that immediately
//! follow it are significant; everything else is ignored.

use crate::error::{ProtocolError, Result};

/// Marker printed before each live session id by the default tool.
pub const DEFAULT_MARKER: &str = "LIVE session at :";

/// Extracts session ids from list output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionListParser {
    marker: String,
}

impl Default for SessionListParser {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

impl SessionListParser {
    /// Creates a parser looking for `marker`.
    pub fn new(marker: &str) -> Result<Self> {
        if marker.is_empty() {
            return Err(ProtocolError::EmptyMarker);
        }
        Ok(Self {
            marker: marker.to_string(),
        })
    }

    /// Text that precedes each session id.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Returns the id following every occurrence of the marker, in order.
    ///
    /// Repeated ids are returned as often as they appear. A marker that is
    /// not followed by a digit yields id 0, and a run of digits too large
    /// for `u32` saturates to `u32::MAX`. Output without the marker yields
    /// an empty list.
    pub fn parse(&self, output: &[u8]) -> Vec<u32> {
        let marker = self.marker.as_bytes();
        let mut ids = Vec::new();
        let mut pos = 0;

        while let Some(found) = find(&output[pos..], marker) {
            pos += found + marker.len();
            ids.push(leading_number(&output[pos..]));
        }

        ids
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn leading_number(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, b| {
            acc.saturating_mul(10).saturating_add(u32::from(b - b'0'))
        })
}

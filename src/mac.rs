//! Hardware address parsing for the source address written into the probe.

use crate::{FlowlatError, Result};
use flowlat_common::MAC_LEN;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 6-byte Ethernet address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; MAC_LEN]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; MAC_LEN]);

    pub fn octets(&self) -> [u8; MAC_LEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl FromStr for MacAddr {
    type Err = FlowlatError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| FlowlatError::InvalidMac {
            input: s.to_string(),
            reason,
        };

        let separator = if s.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != MAC_LEN {
            return Err(invalid("expected six octets"));
        }

        let mut octets = [0u8; MAC_LEN];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid("each octet must be two hex digits"));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid("not a hex digit"))?;
        }

        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = FlowlatError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

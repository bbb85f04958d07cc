// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol version negotiation.
//!
//! Versions are encoded as `major << 8 | minor` on the wire. Each peer advertises a supported
//! `[min, max]` range; the negotiated version of a session is the minimum of both peers'
//! capabilities and never decreases once raised.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A known protocol version.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Version {
    V1_0,
    V1_1,
}

/// Lowest version this implementation supports.
pub const SUPPORTED_VERSION_MIN: Version = Version::V1_0;

/// Highest version this implementation supports.
pub const SUPPORTED_VERSION_MAX: Version = Version::V1_1;

/// Range advertised in our Init and Accept envelopes.
pub const SUPPORTED_VERSION_RANGE: VersionRange = VersionRange {
    min: 0x0100,
    max: 0x0101,
};

impl Version {
    pub fn to_u16(self) -> u16 {
        match self {
            Version::V1_0 => 0x0100,
            Version::V1_1 => 0x0101,
        }
    }

    pub fn try_from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x0100 => Some(Version::V1_0),
            0x0101 => Some(Version::V1_1),
            _ => None,
        }
    }

    /// Maps a wire value to a known version, degrading unknown values to the lowest version.
    ///
    /// A peer applying a version we do not know yet is handled like the oldest one; the major
    /// check in `validate_applied_version` still rejects incompatible generations.
    pub fn from_u16_lossy(raw: u16) -> Self {
        Self::try_from_u16(raw).unwrap_or(SUPPORTED_VERSION_MIN)
    }

    pub fn major(self) -> u8 {
        (self.to_u16() >> 8) as u8
    }

    pub fn minor(self) -> u8 {
        (self.to_u16() & 0xff) as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Version range advertised by a peer.
///
/// Kept as raw wire values since a peer may advertise versions newer than any we know about.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u16,
    pub max: u16,
}

impl VersionRange {
    /// Negotiates the common version between our supported range and the peer's advertised one.
    ///
    /// The result is the highest version we know about that does not exceed the peer's maximum.
    pub fn negotiate(&self) -> Result<Version, VersionError> {
        if self.min > self.max {
            return Err(VersionError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        let ceiling = self.max.min(SUPPORTED_VERSION_MAX.to_u16());
        let negotiated = [SUPPORTED_VERSION_MAX, SUPPORTED_VERSION_MIN]
            .into_iter()
            .find(|version| version.to_u16() <= ceiling)
            .ok_or(VersionError::NoCommonVersion {
                peer_min: self.min,
                peer_max: self.max,
            })?;
        if negotiated.to_u16() < self.min {
            return Err(VersionError::NoCommonVersion {
                peer_min: self.min,
                peer_max: self.max,
            });
        }
        Ok(negotiated)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x}, {:#06x}]", self.min, self.max)
    }
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("peer advertised invalid version range, min {min:#06x} above max {max:#06x}")]
    InvalidRange { min: u16, max: u16 },

    #[error(
        "no version in common with peer range [{peer_min:#06x}, {peer_max:#06x}], \
         we support {SUPPORTED_VERSION_RANGE}"
    )]
    NoCommonVersion { peer_min: u16, peer_max: u16 },
}

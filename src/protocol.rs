//! Wire-format codec for the device command channel.
//!
//! A trigger exchange is one request line and one reply line:
//!
//! - Request: a single-line JSON encoding of [`TriggerCommand`].
//! - Reply: three whitespace-separated tokens, `ERROR_CODE PLANT_ID
//!   IMAGE_DIRECTORY`, e.g. `0 DOR-1049-03 ImageSet_2025_03_01_20_10_58`.
//!
//! `ERROR_CODE` is a base-10 integer interpreted as a bit-flag set: each bit
//! is an independent acquisition fault and arbitrary OR-combinations are
//! legal. Zero means full success. [`ErrorFlags`] preserves the raw integer,
//! so combinations with bits this build does not name still round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};
use crate::metadata::ImagingMetadata;

/// Sentinel the device uses for "no image directory" in a reply.
const EMPTY_FIELD: &str = "-";

/// Bit-flag set carried in the reply's `ERROR_CODE` field.
///
/// Flags combine additively (e.g. `14` = all three 3D cameras corrupt).
/// Bit 7 (`FATAL_UNKNOWN`) is also the reserved flag the bridge itself uses
/// when an exchange fails at the channel level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorFlags(u16);

impl ErrorFlags {
    pub const SUCCESS: ErrorFlags = ErrorFlags(0);
    pub const MAIN_CORRUPT: ErrorFlags = ErrorFlags(1 << 0);
    pub const THREE_D0_CORRUPT: ErrorFlags = ErrorFlags(1 << 1);
    pub const THREE_D1_CORRUPT: ErrorFlags = ErrorFlags(1 << 2);
    pub const THREE_D2_CORRUPT: ErrorFlags = ErrorFlags(1 << 3);
    pub const THERMAL_CORRUPT: ErrorFlags = ErrorFlags(1 << 4);
    pub const RESET_TIMEOUT: ErrorFlags = ErrorFlags(1 << 5);
    pub const REBOOT_TIMEOUT: ErrorFlags = ErrorFlags(1 << 6);
    pub const FATAL_UNKNOWN: ErrorFlags = ErrorFlags(1 << 7);

    const NAMED: [(ErrorFlags, &'static str); 8] = [
        (Self::MAIN_CORRUPT, "MainImageCorrupt"),
        (Self::THREE_D0_CORRUPT, "3DCamera0Corrupt"),
        (Self::THREE_D1_CORRUPT, "3DCamera1Corrupt"),
        (Self::THREE_D2_CORRUPT, "3DCamera2Corrupt"),
        (Self::THERMAL_CORRUPT, "ThermalCorrupt"),
        (Self::RESET_TIMEOUT, "ResetTimeout"),
        (Self::REBOOT_TIMEOUT, "RebootTimeout"),
        (Self::FATAL_UNKNOWN, "FatalUnknown"),
    ];

    /// Build from a raw integer, keeping every bit including unnamed ones.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// The raw integer value.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// True when no fault bit is set.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub fn union(self, other: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | other.0)
    }

    /// Names of the set, known flags.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "Success");
        }
        let names = self.names();
        if names.is_empty() {
            // Only unnamed bits are set
            return write!(f, "Unknown({:#x})", self.0);
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Trigger command sent to the device as one JSON line.
///
/// Field names follow the device's kebab-case convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerCommand {
    pub plant_id: String,
    pub experiment_id: String,
    pub treatment_id: String,
    pub height: f64,
    pub angle: f64,
    /// Name of the settings file selected for this acquisition, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<String>,
    /// Unique id of this exchange (distinct from the trigger id).
    pub uuid: String,
    pub time_stamp: DateTime<Utc>,
}

impl TriggerCommand {
    /// Build a command from the pending metadata and the selected settings
    /// file.
    pub fn new(metadata: &ImagingMetadata, settings: Option<String>) -> Self {
        Self {
            plant_id: metadata.plant_id.clone(),
            experiment_id: metadata.experiment_id.clone(),
            treatment_id: metadata.treatment_id.clone(),
            height: metadata.height,
            angle: metadata.angle,
            settings,
            uuid: uuid::Uuid::new_v4().to_string(),
            time_stamp: Utc::now(),
        }
    }

    /// Serialize to the single-line wire encoding (no trailing newline).
    pub fn encode(&self) -> BridgeResult<String> {
        serde_json::to_string(self)
            .map_err(|e| BridgeError::ChannelProtocol(format!("command encoding failed: {e}")))
    }

    /// Parse a request line. Used by the device simulator.
    pub fn decode(line: &str) -> BridgeResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| BridgeError::ChannelProtocol(format!("malformed command: {e}")))
    }
}

/// Decoded device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub flags: ErrorFlags,
    pub plant_id: String,
    /// `None` when the device sent the empty-field sentinel.
    pub image_directory: Option<String>,
}

impl DeviceReply {
    /// Format a reply line (no trailing newline). Used by the simulator.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {}",
            self.flags.bits(),
            self.plant_id,
            self.image_directory.as_deref().unwrap_or(EMPTY_FIELD)
        )
    }
}

/// Parse a reply line into its three fields.
///
/// # Errors
///
/// Returns `ChannelProtocol` if the line does not split into exactly three
/// whitespace-separated tokens or the first token is not an integer.
pub fn parse_reply(line: &str) -> BridgeResult<DeviceReply> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 3 {
        return Err(BridgeError::ChannelProtocol(format!(
            "expected 3 reply tokens, got {}: {:?}",
            tokens.len(),
            line.trim()
        )));
    }

    let code: u16 = tokens[0].parse().map_err(|_| {
        BridgeError::ChannelProtocol(format!("non-numeric error code: {:?}", tokens[0]))
    })?;

    let image_directory = match tokens[2] {
        EMPTY_FIELD | "" => None,
        dir => Some(dir.to_string()),
    };

    Ok(DeviceReply {
        flags: ErrorFlags::from_bits(code),
        plant_id: tokens[1].to_string(),
        image_directory,
    })
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Approval decision on a signal. Set exactly once; `Pending` is the initial
/// state and the only one a decision can be applied to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

/// Device execution outcome as reported on the ack wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Placed,
    Failed,
    Cancelled,
    Unknown,
}

impl ExecStatus {
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Placed)
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Placed => "placed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Registration seed. Base64 at rest, never printed: the Debug impl redacts
/// so a stray `{:?}` on a Device can never leak it into logs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretSeed(String);

impl SecretSeed {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(BASE64.encode(bytes))
    }

    pub fn bytes(&self) -> Result<Zeroizing<Vec<u8>>, base64::DecodeError> {
        Ok(Zeroizing::new(BASE64.decode(self.0.as_bytes())?))
    }
}

impl fmt::Debug for SecretSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretSeed(****)")
    }
}

/// A registered trading client endpoint. Never physically deleted; revocation
/// is the only mutation (audit requirement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub client_id: String,
    pub seed: SecretSeed,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// One version of a device's symmetric key. Material is an opaque 32-byte
/// AEAD/HMAC key, base64 at rest. Versions are never edited in place:
/// rotation writes a new row and stamps the superseded one with `expires_at`.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceKey {
    pub device_id: String,
    pub version: u32,
    pub material_b64: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DeviceKey {
    pub fn material(&self) -> Result<Zeroizing<Vec<u8>>, base64::DecodeError> {
        Ok(Zeroizing::new(BASE64.decode(self.material_b64.as_bytes())?))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("device_id", &self.device_id)
            .field("version", &self.version)
            .field("material_b64", &"****")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Owner-only protective levels. Carried inside the encrypted poll envelope
/// and copied onto the position at ack time. The stored blob may be absent or
/// corrupt; decoding is lenient and degrades to `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerLevels {
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

/// Decode the raw owner-levels blob stored on a signal. `None` input, or a
/// blob that does not parse as levels, both yield `None`; the caller logs
/// and proceeds without levels rather than failing the whole operation.
pub fn decode_owner_levels(raw: Option<&serde_json::Value>) -> Option<OwnerLevels> {
    let value = raw?;
    serde_json::from_value::<OwnerLevels>(value.clone()).ok()
}

/// Tenant-scoped trade instruction. Immutable after creation except for the
/// one-shot decision (and the approval id it pins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    /// Raw owner-only SL/TP blob; decoded leniently via [`decode_owner_levels`].
    #[serde(default)]
    pub owner_levels: Option<serde_json::Value>,
    pub decision: Decision,
    #[serde(default)]
    pub approval_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub signal_id: String,
    pub client_id: String,
    pub decided_at: DateTime<Utc>,
}

/// One device's reported outcome for one approval. Immutable once written;
/// duplicates for the same (approval, device) pair are deliberately kept as
/// separate rows for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub approval_id: String,
    pub signal_id: String,
    pub device_id: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub broker_ticket: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived 1:1 from a successful execution. `closed_at` is the only mutation
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub position_id: String,
    pub signal_id: String,
    pub approval_id: String,
    pub device_id: String,
    pub execution_id: String,
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub levels: Option<OwnerLevels>,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl OpenPosition {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

// --- Wire types: device protocol ---

/// Ack body as received on the wire (flat JSON). Converted into the tagged
/// [`ExecutionOutcome`] before any protocol logic runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub approval_id: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub broker_ticket: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Execution outcome as a sum type: each variant carries only the fields that
/// are meaningful for it. Fields that make no sense for the reported status
/// (a broker ticket on a cancel, say) are dropped at conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Placed { broker_ticket: Option<String> },
    Failed { error: Option<String> },
    Cancelled,
    Unknown,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecStatus {
        match self {
            Self::Placed { .. } => ExecStatus::Placed,
            Self::Failed { .. } => ExecStatus::Failed,
            Self::Cancelled => ExecStatus::Cancelled,
            Self::Unknown => ExecStatus::Unknown,
        }
    }

    pub fn broker_ticket(&self) -> Option<&str> {
        match self {
            Self::Placed { broker_ticket } => broker_ticket.as_deref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => error.as_deref(),
            _ => None,
        }
    }
}

impl From<&AckRequest> for ExecutionOutcome {
    fn from(req: &AckRequest) -> Self {
        match req.status {
            ExecStatus::Placed => Self::Placed {
                broker_ticket: req.broker_ticket.clone(),
            },
            ExecStatus::Failed => Self::Failed {
                error: req.error.clone(),
            },
            ExecStatus::Cancelled => Self::Cancelled,
            ExecStatus::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub execution_id: String,
    pub approval_id: String,
    pub status: ExecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

/// One instruction inside the encrypted poll batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollInstruction {
    pub approval_id: String,
    pub signal_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<OwnerLevels>,
    pub created_at: DateTime<Utc>,
}

/// Plaintext of the poll response, serialized then whole-envelope encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollBatch {
    pub signals: Vec<PollInstruction>,
}

// --- Wire types: admin surface ---

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDeviceRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterDeviceResponse {
    pub device_id: String,
    pub client_id: String,
    /// Derived key material, returned exactly once at issue time.
    pub key_b64: String,
    pub key_version: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotateKeyResponse {
    pub device_id: String,
    pub key_b64: String,
    pub key_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSignalRequest {
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub owner_levels: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClosePositionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

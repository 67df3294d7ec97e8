//! Persistent volume and claim types.
//!
//! A claim binds 1:1 to a volume meeting or exceeding its request. The
//! binding is a cross-reference between the two objects, never an ownership
//! edge, and is irreversible while the claim exists.

use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::meta::Uid;

/// How a volume may be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

/// Claim template carried by stateful set specs; one claim is stamped out
/// per ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaimTemplate {
    /// Claim name prefix; the ordinal pod name is appended.
    pub name: String,

    pub storage_class: String,

    #[serde(default)]
    pub access_modes: Vec<AccessMode>,

    pub request_bytes: u64,
}

/// Desired state of a persistent volume claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcSpec {
    pub storage_class: String,

    #[serde(default)]
    pub access_modes: Vec<AccessMode>,

    pub request_bytes: u64,
}

/// Claim binding phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvcPhase {
    #[default]
    Pending,
    Bound,
}

/// Observed state of a claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcStatus {
    #[serde(default)]
    pub phase: PvcPhase,

    /// Name of the bound volume once bound.
    #[serde(default)]
    pub volume_name: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A persistent volume claim object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcObject {
    pub spec: PvcSpec,

    #[serde(default)]
    pub status: PvcStatus,
}

/// What happens to a volume's data when its claim goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Backing data is kept; the volume parks in `Released` until an
    /// operator intervenes.
    #[default]
    Retain,
}

/// Back-reference from a bound volume to its claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
}

/// Desired/declared state of a persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvSpec {
    pub storage_class: String,

    #[serde(default)]
    pub access_modes: Vec<AccessMode>,

    pub capacity_bytes: u64,

    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

/// Volume binding phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvPhase {
    #[default]
    Available,
    Bound,
    /// Previously bound; claim is gone but data is retained.
    Released,
}

/// Observed state of a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvStatus {
    #[serde(default)]
    pub phase: PvPhase,

    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
}

/// A persistent volume object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvObject {
    pub spec: PvSpec,

    #[serde(default)]
    pub status: PvStatus,
}

impl PvObject {
    /// Returns true if this volume can satisfy the claim: same class,
    /// superset of the requested access modes, and enough capacity.
    #[must_use]
    pub fn satisfies(&self, claim: &PvcSpec) -> bool {
        self.status.phase == PvPhase::Available
            && self.spec.storage_class == claim.storage_class
            && claim
                .access_modes
                .iter()
                .all(|m| self.spec.access_modes.contains(m))
            && self.spec.capacity_bytes >= claim.request_bytes
    }
}

//! Object identity and metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::labels::Labels;

/// Namespace used when a client does not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Unique identity of one object incarnation.
///
/// A name can be reused after deletion; the uid cannot. Controllers compare
/// uids in owner references so a recreated object is never mistaken for its
/// predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(Ulid);

impl Uid {
    /// Generates a fresh uid.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// The nil uid, used for objects that have not been persisted yet.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Ulid::nil())
    }

    /// Returns true if this uid has not been assigned by the store.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::nil()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of objects the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Pod,
    Node,
    ReplicaSet,
    Deployment,
    StatefulSet,
    PersistentVolumeClaim,
    PersistentVolume,
    HorizontalPodAutoscaler,
}

impl Kind {
    /// All kinds, in a fixed order.
    pub const ALL: [Kind; 8] = [
        Kind::Pod,
        Kind::Node,
        Kind::ReplicaSet,
        Kind::Deployment,
        Kind::StatefulSet,
        Kind::PersistentVolumeClaim,
        Kind::PersistentVolume,
        Kind::HorizontalPodAutoscaler,
    ];

    /// Returns true for kinds that live outside any namespace.
    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Kind::Node | Kind::PersistentVolume)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Pod => "pod",
            Kind::Node => "node",
            Kind::ReplicaSet => "replicaset",
            Kind::Deployment => "deployment",
            Kind::StatefulSet => "statefulset",
            Kind::PersistentVolumeClaim => "persistentvolumeclaim",
            Kind::PersistentVolume => "persistentvolume",
            Kind::HorizontalPodAutoscaler => "horizontalpodautoscaler",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod" => Ok(Kind::Pod),
            "node" => Ok(Kind::Node),
            "replicaset" => Ok(Kind::ReplicaSet),
            "deployment" => Ok(Kind::Deployment),
            "statefulset" => Ok(Kind::StatefulSet),
            "persistentvolumeclaim" => Ok(Kind::PersistentVolumeClaim),
            "persistentvolume" => Ok(Kind::PersistentVolume),
            "horizontalpodautoscaler" => Ok(Kind::HorizontalPodAutoscaler),
            other => Err(format!("unknown kind: {other}")),
        }
    }
}

/// The unique key of an object: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A parent pointer from a child object to its owning controller object.
///
/// Ownership is strictly tree shaped. `cascade` controls whether the garbage
/// collector removes the child when the owner disappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: Kind,
    pub name: String,
    pub uid: Uid,

    /// True if the owner is the managing controller for this child.
    pub controller: bool,

    /// True if deleting the owner should delete this child.
    pub cascade: bool,
}

/// Common metadata carried by every object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,

    /// Store-assigned identity; nil until the object is persisted.
    #[serde(default)]
    pub uid: Uid,

    /// Store-assigned monotonic version, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default)]
    pub labels: Labels,

    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,

    /// Set when graceful deletion has started; the object is terminating
    /// until its finalizing collaborator removes it from the store.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uid::nil(),
            resource_version: 0,
            labels: Labels::default(),
            owner_references: Vec::new(),
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    /// Returns true once graceful deletion has started.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Returns true if `uid` appears among this object's owners.
    #[must_use]
    pub fn owned_by(&self, uid: Uid) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }

    /// The managing controller reference, if any.
    #[must_use]
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_roundtrip() {
        for kind in Kind::ALL {
            let parsed: Kind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn object_key_display() {
        let key = ObjectKey::new(Kind::Pod, "default", "web-0");
        assert_eq!(key.to_string(), "pod/default/web-0");
    }

    #[test]
    fn nil_uid_is_nil() {
        assert!(Uid::nil().is_nil());
        assert!(!Uid::new().is_nil());
    }

    #[test]
    fn owned_by_checks_uid() {
        let owner = Uid::new();
        let mut meta = ObjectMeta::new("default", "child");
        assert!(!meta.owned_by(owner));
        meta.owner_references.push(OwnerReference {
            kind: Kind::ReplicaSet,
            name: "rs".to_string(),
            uid: owner,
            controller: true,
            cascade: true,
        });
        assert!(meta.owned_by(owner));
        assert!(meta.controller_ref().is_some());
    }
}

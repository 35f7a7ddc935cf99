//! Map element types: nodes, ways, relations and their shared metadata.

use thiserror::Error;

use crate::coord::NanoDegrees;
use crate::tags::Tags;

/// The three primitive element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ElementKind {
    /// A point with coordinates.
    Node,
    /// An ordered line of node references.
    Way,
    /// An ordered group of typed, roled members.
    Relation,
}

impl ElementKind {
    /// The lowercase kind name used by the wire formats and the schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }

    /// Parse a lowercase kind name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "node" => Some(Self::Node),
            "way" => Some(Self::Way),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version, provenance and visibility shared by every element.
///
/// Mirrors the metadata columns of the backing store: version numbers are
/// monotonically non-decreasing per `(kind, id)` across applied changesets,
/// and deletion is expressed as `visible = false` rather than row removal.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metadata {
    /// Element version, starting at 1 for freshly created objects.
    pub version: u32,
    /// Changeset that produced this version.
    pub changeset: i64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Author identifier; zero when unknown.
    pub uid: i64,
    /// Author display name; empty when unknown.
    pub user: String,
    /// Whether the element is live (false marks a tombstone).
    pub visible: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: 1,
            changeset: 0,
            timestamp: 0,
            uid: 0,
            user: String::new(),
            visible: true,
        }
    }
}

/// Errors raised when validating element constructors.
#[derive(Debug, Error, PartialEq)]
pub enum ElementError {
    /// Node latitude outside [-90, 90] degrees.
    #[error("node {id} latitude {lat} is outside [-90, 90] degrees")]
    LatitudeOutOfRange {
        /// Offending node id.
        id: i64,
        /// Latitude in degrees.
        lat: f64,
    },
    /// Node longitude outside [-180, 180] degrees.
    #[error("node {id} longitude {lon} is outside [-180, 180] degrees")]
    LongitudeOutOfRange {
        /// Offending node id.
        id: i64,
        /// Longitude in degrees.
        lon: f64,
    },
    /// A way must reference at least one node.
    #[error("way {id} has no node references")]
    EmptyWay {
        /// Offending way id.
        id: i64,
    },
}

/// A point with fixed-point coordinates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Unique identifier within the node kind.
    pub id: i64,
    /// Latitude in nanodegrees.
    pub lat: NanoDegrees,
    /// Longitude in nanodegrees.
    pub lon: NanoDegrees,
    /// Ordered tags.
    pub tags: Tags,
    /// Version and provenance.
    pub meta: Metadata,
}

impl Node {
    /// Validates coordinates and constructs a [`Node`].
    pub fn new(
        id: i64,
        lat: NanoDegrees,
        lon: NanoDegrees,
        tags: Tags,
        meta: Metadata,
    ) -> Result<Self, ElementError> {
        if !(-90.0..=90.0).contains(&lat.degrees()) {
            return Err(ElementError::LatitudeOutOfRange {
                id,
                lat: lat.degrees(),
            });
        }
        if !(-180.0..=180.0).contains(&lon.degrees()) {
            return Err(ElementError::LongitudeOutOfRange {
                id,
                lon: lon.degrees(),
            });
        }
        Ok(Self {
            id,
            lat,
            lon,
            tags,
            meta,
        })
    }

    /// Construct from degree coordinates, rounding to nanodegrees.
    pub fn from_degrees(
        id: i64,
        lat: f64,
        lon: f64,
        tags: Tags,
        meta: Metadata,
    ) -> Result<Self, ElementError> {
        Self::new(
            id,
            NanoDegrees::from_degrees(lat),
            NanoDegrees::from_degrees(lon),
            tags,
            meta,
        )
    }
}

/// An ordered line or polygon defined by node references.
///
/// The reference order defines the geometry and must survive every round
/// trip unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Way {
    /// Unique identifier within the way kind.
    pub id: i64,
    /// Ordered node references.
    pub refs: Vec<i64>,
    /// Ordered tags.
    pub tags: Tags,
    /// Version and provenance.
    pub meta: Metadata,
}

impl Way {
    /// Validates and constructs a [`Way`].
    pub fn new(id: i64, refs: Vec<i64>, tags: Tags, meta: Metadata) -> Result<Self, ElementError> {
        if refs.is_empty() {
            return Err(ElementError::EmptyWay { id });
        }
        Ok(Self {
            id,
            refs,
            tags,
            meta,
        })
    }
}

/// A single relation member: a typed, roled reference to another element.
///
/// Members reference by `(kind, id)`, never by owning pointer, so relations
/// may reference themselves or each other without creating ownership cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    /// Kind of the referenced element.
    pub kind: ElementKind,
    /// Identifier of the referenced element.
    pub id: i64,
    /// Free-form role string; often empty.
    pub role: String,
}

impl Member {
    /// Construct a member reference.
    #[must_use]
    pub fn new(kind: ElementKind, id: i64, role: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            role: role.into(),
        }
    }
}

/// An ordered group of typed members.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relation {
    /// Unique identifier within the relation kind.
    pub id: i64,
    /// Ordered members.
    pub members: Vec<Member>,
    /// Ordered tags.
    pub tags: Tags,
    /// Version and provenance.
    pub meta: Metadata,
}

impl Relation {
    /// Construct a [`Relation`].
    #[must_use]
    pub fn new(id: i64, members: Vec<Member>, tags: Tags, meta: Metadata) -> Self {
        Self {
            id,
            members,
            tags,
            meta,
        }
    }
}

/// Any of the three element kinds, tagged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Element {
    /// A node.
    Node(Node),
    /// A way.
    Way(Way),
    /// A relation.
    Relation(Relation),
}

impl Element {
    /// The element's kind.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Node(_) => ElementKind::Node,
            Self::Way(_) => ElementKind::Way,
            Self::Relation(_) => ElementKind::Relation,
        }
    }

    /// The element's identifier.
    #[must_use]
    pub const fn id(&self) -> i64 {
        match self {
            Self::Node(n) => n.id,
            Self::Way(w) => w.id,
            Self::Relation(r) => r.id,
        }
    }

    /// Shared metadata.
    #[must_use]
    pub const fn meta(&self) -> &Metadata {
        match self {
            Self::Node(n) => &n.meta,
            Self::Way(w) => &w.meta,
            Self::Relation(r) => &r.meta,
        }
    }

    /// Ordered tags.
    #[must_use]
    pub const fn tags(&self) -> &Tags {
        match self {
            Self::Node(n) => &n.tags,
            Self::Way(w) => &w.tags,
            Self::Relation(r) => &r.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(90.5)]
    #[case(-91.0)]
    fn node_rejects_out_of_range_latitude(#[case] lat: f64) {
        let result = Node::from_degrees(1, lat, 0.0, Tags::new(), Metadata::default());
        assert!(matches!(
            result,
            Err(ElementError::LatitudeOutOfRange { id: 1, .. })
        ));
    }

    #[rstest]
    fn way_requires_refs() {
        let result = Way::new(7, Vec::new(), Tags::new(), Metadata::default());
        assert!(matches!(result, Err(ElementError::EmptyWay { id: 7 })));
    }

    #[rstest]
    fn element_exposes_kind_and_id() {
        let node = Node::from_degrees(3, 1.0, 2.0, Tags::new(), Metadata::default()).unwrap();
        let element = Element::Node(node);
        assert_eq!(element.kind(), ElementKind::Node);
        assert_eq!(element.id(), 3);
    }

    #[rstest]
    fn kind_name_round_trips() {
        for kind in [ElementKind::Node, ElementKind::Way, ElementKind::Relation] {
            assert_eq!(ElementKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ElementKind::parse("area"), None);
    }
}

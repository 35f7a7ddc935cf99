//! Ordered incremental update batches.

use thiserror::Error;

use crate::element::Element;

/// The operation a changeset entry applies to its target element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChangeAction {
    /// Introduce a new element; its version must be 1.
    Create,
    /// Replace an existing element with the next version.
    Modify,
    /// Tombstone an existing element (mark not visible).
    Delete,
}

impl ChangeAction {
    /// The lowercase action name used by change documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    /// Parse a lowercase action name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One ordered operation within a changeset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEntry {
    /// Position in the replication stream; strictly ascending per batch.
    pub sequence: u64,
    /// Operation to apply.
    pub action: ChangeAction,
    /// Target element snapshot. Deletes carry the tombstone snapshot so the
    /// stored metadata reflects who removed the element and when.
    pub element: Element,
}

/// Errors raised when validating a changeset.
#[derive(Debug, Error, PartialEq)]
pub enum ChangesetError {
    /// Entries were not in strictly ascending sequence order.
    #[error("changeset {changeset}: sequence {next} follows {prev}")]
    OutOfOrder {
        /// Offending changeset id.
        changeset: i64,
        /// Sequence number of the earlier entry.
        prev: u64,
        /// Offending sequence number.
        next: u64,
    },
}

/// An ordered batch of create / modify / delete operations.
///
/// Batches are applied atomically: the replication engine commits either all
/// applicable entries or none.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Changeset {
    /// Upstream changeset identifier.
    pub id: i64,
    /// Entries ordered by ascending sequence number.
    pub entries: Vec<ChangeEntry>,
}

impl Changeset {
    /// An empty changeset with the given id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    /// Append an entry.
    pub fn push(&mut self, sequence: u64, action: ChangeAction, element: Element) {
        self.entries.push(ChangeEntry {
            sequence,
            action,
            element,
        });
    }

    /// Verify entries are in strictly ascending sequence order.
    pub fn validate_order(&self) -> Result<(), ChangesetError> {
        for pair in self.entries.windows(2) {
            if pair[1].sequence <= pair[0].sequence {
                return Err(ChangesetError::OutOfOrder {
                    changeset: self.id,
                    prev: pair[0].sequence,
                    next: pair[1].sequence,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Metadata, Node};
    use crate::tags::Tags;
    use rstest::rstest;

    fn entry_element(id: i64) -> Element {
        Element::Node(Node::from_degrees(id, 0.0, 0.0, Tags::new(), Metadata::default()).unwrap())
    }

    #[rstest]
    fn accepts_ascending_sequences() {
        let mut changeset = Changeset::new(9);
        changeset.push(1, ChangeAction::Create, entry_element(1));
        changeset.push(2, ChangeAction::Modify, entry_element(1));
        assert_eq!(changeset.validate_order(), Ok(()));
    }

    #[rstest]
    #[case(3, 3)]
    #[case(4, 2)]
    fn rejects_non_ascending_sequences(#[case] first: u64, #[case] second: u64) {
        let mut changeset = Changeset::new(9);
        changeset.push(first, ChangeAction::Create, entry_element(1));
        changeset.push(second, ChangeAction::Delete, entry_element(2));
        assert_eq!(
            changeset.validate_order(),
            Err(ChangesetError::OutOfOrder {
                changeset: 9,
                prev: first,
                next: second
            })
        );
    }
}

//! Cross-structure invariant validation.
//!
//! Compares the ANN structure, the identifier array and the metadata store
//! and reports every disagreement found, not just the first.

use crate::error::{StoreError, StoreResult};
use crate::storage::metadata::MetadataStore;
use crate::types::{ChunkId, Position};
use crate::vector::VectorIndexProvider;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyIssue {
    CountMismatch {
        index: usize,
        ids: usize,
        metadata: usize,
    },
    MissingMetadata {
        chunk_id: ChunkId,
        position: Position,
    },
    PositionMismatch {
        chunk_id: ChunkId,
        actual: Position,
        recorded: Position,
    },
    OrphanMetadata {
        chunk_id: ChunkId,
        recorded: Position,
    },
    DuplicateId {
        chunk_id: ChunkId,
        positions: Vec<Position>,
    },
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountMismatch {
                index,
                ids,
                metadata,
            } => write!(
                f,
                "count mismatch: index={index}, identifiers={ids}, metadata={metadata}"
            ),
            Self::MissingMetadata { chunk_id, position } => {
                write!(f, "{chunk_id} at position {position} has no metadata record")
            }
            Self::PositionMismatch {
                chunk_id,
                actual,
                recorded,
            } => write!(
                f,
                "{chunk_id} is at position {actual} but metadata records {recorded}"
            ),
            Self::OrphanMetadata { chunk_id, recorded } => write!(
                f,
                "metadata for {chunk_id} (position {recorded}) has no indexed vector"
            ),
            Self::DuplicateId {
                chunk_id,
                positions,
            } => write!(f, "{chunk_id} appears at positions {positions:?}"),
        }
    }
}

/// Result of a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    fn from_issues(issues: Vec<ConsistencyIssue>) -> Self {
        Self {
            is_consistent: issues.is_empty(),
            issues,
        }
    }

    /// Turn a failed report into a `ConsistencyFault`.
    pub fn into_result(self) -> StoreResult<()> {
        if self.is_consistent {
            Ok(())
        } else {
            Err(StoreError::ConsistencyFault {
                issues: self.issues.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

/// Validate every structure against the others.
pub fn check(
    provider: &VectorIndexProvider,
    metadata: &MetadataStore,
) -> StoreResult<ConsistencyReport> {
    let records = metadata.records()?;
    let mut issues = Vec::new();

    let index_len = provider.index_len();
    let ids = provider.ids();
    if index_len != ids.len() || ids.len() != records.len() {
        issues.push(ConsistencyIssue::CountMismatch {
            index: index_len,
            ids: ids.len(),
            metadata: records.len(),
        });
    }

    let mut occurrences: HashMap<&ChunkId, Vec<Position>> = HashMap::with_capacity(ids.len());
    for (position, id) in ids.iter().enumerate() {
        occurrences.entry(id).or_default().push(position);
    }
    let mut duplicates: Vec<_> = occurrences
        .iter()
        .filter(|(_, positions)| positions.len() > 1)
        .map(|(id, positions)| ConsistencyIssue::DuplicateId {
            chunk_id: (*id).clone(),
            positions: positions.clone(),
        })
        .collect();
    duplicates.sort_by_key(|issue| match issue {
        ConsistencyIssue::DuplicateId { positions, .. } => positions[0],
        _ => 0,
    });
    issues.extend(duplicates);

    let recorded: HashMap<&ChunkId, Position> =
        records.iter().map(|r| (&r.chunk_id, r.position)).collect();
    for (position, id) in ids.iter().enumerate() {
        match recorded.get(id) {
            None => issues.push(ConsistencyIssue::MissingMetadata {
                chunk_id: id.clone(),
                position,
            }),
            Some(&stored) if stored != position && occurrences[id].len() == 1 => {
                issues.push(ConsistencyIssue::PositionMismatch {
                    chunk_id: id.clone(),
                    actual: position,
                    recorded: stored,
                });
            }
            Some(_) => {}
        }
    }

    for record in &records {
        if !occurrences.contains_key(&record.chunk_id) {
            issues.push(ConsistencyIssue::OrphanMetadata {
                chunk_id: record.chunk_id.clone(),
                recorded: record.position,
            });
        }
    }

    Ok(ConsistencyReport::from_issues(issues))
}

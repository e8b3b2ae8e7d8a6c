//! Durable agent identities.
//!
//! Identities are hatched from a parent (or as a genesis root), carry their
//! full ancestor lineage, and alternate energy polarity per generation.
//! Apart from the optional state vector an identity never mutates;
//! destruction is an explicit administrative action elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{SosError, SosResult};

/// Dimensionality of the optional agent state vector.
pub const STATE_VECTOR_DIM: usize = 16;

/// Energy polarity. Genesis is yang; children alternate per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    /// Receptive pole.
    Yin,
    /// Active pole.
    Yang,
}

impl Polarity {
    /// The opposite polarity.
    pub fn flip(&self) -> Self {
        match self {
            Self::Yin => Self::Yang,
            Self::Yang => Self::Yin,
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yin => f.write_str("yin"),
            Self::Yang => f.write_str("yang"),
        }
    }
}

/// A durable identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Role description (e.g. `orchestrator`, `scribe`).
    pub role: String,
    /// Energy polarity.
    pub polarity: Polarity,
    /// Ordered ancestor ids, oldest (genesis) first.
    pub lineage: Vec<Uuid>,
    /// Depth in the lineage tree; genesis is 0.
    pub generation: u32,
    /// Optional sixteen-dimensional state vector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<Vec<f64>>,
    /// Hatch timestamp.
    pub hatched_at: DateTime<Utc>,
}

impl AgentIdentity {
    /// Construct the genesis root identity.
    pub fn genesis(name: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            role: role.to_owned(),
            polarity: Polarity::Yang,
            lineage: Vec::new(),
            generation: 0,
            state_vector: None,
            hatched_at: Utc::now(),
        }
    }

    /// Hatch a child identity from this one.
    ///
    /// The child inherits the full lineage with this identity appended,
    /// increments the generation, and flips polarity.
    pub fn hatch(&self, name: &str, role: &str) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(self.id);
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            role: role.to_owned(),
            polarity: self.polarity.flip(),
            lineage,
            generation: self.generation + 1,
            state_vector: None,
            hatched_at: Utc::now(),
        }
    }

    /// Replace the state vector; the only mutation an identity admits.
    pub fn set_state_vector(&mut self, vector: Vec<f64>) -> SosResult<()> {
        if vector.len() != STATE_VECTOR_DIM {
            return Err(SosError::Validation(format!(
                "state vector must have {STATE_VECTOR_DIM} dimensions, got {}",
                vector.len()
            )));
        }
        self.state_vector = Some(vector);
        Ok(())
    }

    /// Whether `ancestor` appears anywhere in this identity's lineage.
    pub fn descends_from(&self, ancestor: Uuid) -> bool {
        self.lineage.contains(&ancestor)
    }
}

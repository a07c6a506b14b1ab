//! Vessel partition model
//!
//! An ordered sequence of contiguous vessels covering a fixed total. Every
//! mutation keeps the percentages summing to that total: splitting carves a
//! new vessel out of an existing one, removing hands the share back to the
//! preceding vessel.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{DEFAULT_MAX_VESSELS, DEFAULT_RESERVED_PERCENTAGE};
use crate::validation::{self, ValidationError};

/// A share of the resource pool with its owner and member users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vessel {
    pub percentage: u32,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
}

impl Vessel {
    pub fn new(percentage: u32) -> Self {
        Self {
            percentage,
            owner: None,
            users: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.push(user.into());
        self
    }

    /// No owner and no members
    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.users.is_empty()
    }

    pub fn has_member(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }
}

/// Sizing rules for a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLimits {
    /// Sum every partition must keep (100 minus the reserved share)
    pub total: u32,
    pub max_vessels: usize,
}

impl PartitionLimits {
    pub fn from_reserved(reserved_percentage: u32, max_vessels: usize) -> Self {
        Self {
            total: 100u32.saturating_sub(reserved_percentage),
            max_vessels,
        }
    }

    /// The share left to the reserved vessel
    pub fn reserved(&self) -> u32 {
        100u32.saturating_sub(self.total)
    }
}

impl Default for PartitionLimits {
    fn default() -> Self {
        Self::from_reserved(DEFAULT_RESERVED_PERCENTAGE, DEFAULT_MAX_VESSELS)
    }
}

/// How a user is attached to a vessel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Member,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Member => write!(f, "member"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("The first vessel cannot be removed.")]
    FirstVessel,

    #[error("No vessel at index {index}.")]
    NoSuchVessel { index: usize },

    #[error("{user} is already a user of vessel {index}.")]
    DuplicateMember { index: usize, user: String },

    #[error("{user} is not a user of vessel {index}.")]
    NotAMember { index: usize, user: String },
}

/// Ordered vessels whose percentages sum to `limits.total`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    limits: PartitionLimits,
    vessels: Vec<Vessel>,
}

impl Partition {
    /// A single ownerless vessel covering the whole total
    pub fn new(limits: PartitionLimits) -> Self {
        Self {
            limits,
            vessels: vec![Vessel::new(limits.total)],
        }
    }

    /// Rebuild a partition from stored vessels, checking the sum invariant
    pub fn from_vessels(vessels: Vec<Vessel>, limits: PartitionLimits) -> Result<Self, ValidationError> {
        if vessels.is_empty() {
            return Err(ValidationError::NoVessels);
        }
        if vessels.len() > limits.max_vessels {
            return Err(ValidationError::TooManyVessels {
                max: limits.max_vessels,
                got: vessels.len(),
            });
        }
        let percentages: Vec<u32> = vessels.iter().map(|v| v.percentage).collect();
        validation::validate_vessel_percentages(&percentages, limits.total)?;
        for (index, vessel) in vessels.iter().enumerate() {
            if let Some(user) = first_duplicate(&vessel.users) {
                return Err(ValidationError::DuplicateVesselUser {
                    index,
                    user: user.to_string(),
                });
            }
        }
        Ok(Self { limits, vessels })
    }

    pub fn limits(&self) -> PartitionLimits {
        self.limits
    }

    pub fn vessels(&self) -> &[Vessel] {
        &self.vessels
    }

    pub fn into_vessels(self) -> Vec<Vessel> {
        self.vessels
    }

    pub fn len(&self) -> usize {
        self.vessels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vessels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Vessel> {
        self.vessels.get(index)
    }

    pub fn total(&self) -> u32 {
        self.vessels.iter().map(|v| v.percentage).sum()
    }

    pub fn is_full(&self) -> bool {
        self.vessels.len() >= self.limits.max_vessels
    }

    /// Offsets where one vessel ends and the next begins
    pub fn boundaries(&self) -> Vec<u32> {
        let mut offset = 0;
        let mut boundaries = Vec::with_capacity(self.vessels.len().saturating_sub(1));
        for vessel in &self.vessels[..self.vessels.len().saturating_sub(1)] {
            offset += vessel.percentage;
            boundaries.push(offset);
        }
        boundaries
    }

    /// Locate the vessel covering `offset`, returning its index and start
    pub fn find(&self, offset: u32) -> Option<(usize, u32)> {
        let mut start = 0;
        for (index, vessel) in self.vessels.iter().enumerate() {
            let end = start + vessel.percentage;
            if offset < end {
                return Some((index, start));
            }
            start = end;
        }
        None
    }

    /// Split the vessel containing `at_offset` strictly inside its span.
    ///
    /// Returns the index of the new vessel, or `None` if the offset is on a
    /// boundary, outside the partition, or the vessel limit is reached.
    pub fn split(&mut self, at_offset: u32) -> Option<usize> {
        if self.is_full() {
            debug!(at_offset, max = self.limits.max_vessels, "split ignored, partition full");
            return None;
        }
        let (index, start) = self.find(at_offset)?;
        if at_offset <= start {
            debug!(at_offset, "split ignored, offset on a boundary");
            return None;
        }

        let vessel = &mut self.vessels[index];
        let end = start + vessel.percentage;
        vessel.percentage = at_offset - start;
        self.vessels.insert(index + 1, Vessel::new(end - at_offset));

        debug!(index, at_offset, "split vessel");
        Some(index + 1)
    }

    /// Remove a vessel, handing its share to the preceding one
    pub fn remove(&mut self, index: usize) -> Result<Vessel, PartitionError> {
        if index >= self.vessels.len() {
            return Err(PartitionError::NoSuchVessel { index });
        }
        if index == 0 {
            return Err(PartitionError::FirstVessel);
        }
        let removed = self.vessels.remove(index);
        self.vessels[index - 1].percentage += removed.percentage;
        debug!(index, percentage = removed.percentage, "removed vessel");
        Ok(removed)
    }

    /// Set the owner or add a member.
    ///
    /// A repeated member assignment leaves the vessel unchanged and reports
    /// `DuplicateMember`.
    pub fn assign(&mut self, index: usize, role: Role, user: &str) -> Result<(), PartitionError> {
        let vessel = self.vessel_mut(index)?;
        match role {
            Role::Owner => {
                vessel.owner = Some(user.to_string());
            }
            Role::Member => {
                if vessel.has_member(user) {
                    return Err(PartitionError::DuplicateMember {
                        index,
                        user: user.to_string(),
                    });
                }
                vessel.users.push(user.to_string());
            }
        }
        Ok(())
    }

    /// Remove the owner, returning the previous one
    pub fn clear_owner(&mut self, index: usize) -> Result<Option<String>, PartitionError> {
        Ok(self.vessel_mut(index)?.owner.take())
    }

    pub fn remove_member(&mut self, index: usize, user: &str) -> Result<(), PartitionError> {
        let vessel = self.vessel_mut(index)?;
        let before = vessel.users.len();
        vessel.users.retain(|u| u != user);
        if vessel.users.len() == before {
            return Err(PartitionError::NotAMember {
                index,
                user: user.to_string(),
            });
        }
        Ok(())
    }

    /// Drop every tag for `user`. Returns how many were removed.
    pub fn forget_user(&mut self, user: &str) -> usize {
        let mut removed = 0;
        for vessel in &mut self.vessels {
            if vessel.owner.as_deref() == Some(user) {
                vessel.owner = None;
                removed += 1;
            }
            let before = vessel.users.len();
            vessel.users.retain(|u| u != user);
            removed += before - vessel.users.len();
        }
        removed
    }

    /// First vessel that has members but no owner
    pub fn unowned_vessel(&self) -> Option<usize> {
        self.vessels
            .iter()
            .position(|v| v.owner.is_none() && !v.users.is_empty())
    }

    /// Every vessel with members or an owner has an owner
    pub fn is_submittable(&self) -> bool {
        self.unowned_vessel().is_none()
    }

    fn vessel_mut(&mut self, index: usize) -> Result<&mut Vessel, PartitionError> {
        self.vessels
            .get_mut(index)
            .ok_or(PartitionError::NoSuchVessel { index })
    }
}

fn first_duplicate(users: &[String]) -> Option<&str> {
    users
        .iter()
        .enumerate()
        .find(|(i, u)| users[..*i].contains(u))
        .map(|(_, u)| u.as_str())
}

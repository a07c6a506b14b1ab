//! Build session state
//!
//! `BuildState` is what gets persisted between requests; `BuildSession` is
//! the live workspace that enforces the rules spanning users and vessels.

use serde::{Deserialize, Serialize};

use crate::partition::{Partition, PartitionLimits, Role, Vessel};
use crate::types::UserRecord;
use crate::validation::{self, ValidationError};
use crate::Result;

/// Serialized form of a build session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub vessels: Vec<Vessel>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl BuildState {
    /// One ownerless vessel covering the whole total, no users
    pub fn default_for(limits: PartitionLimits) -> Self {
        Self {
            vessels: vec![Vessel::new(limits.total)],
            users: Vec::new(),
        }
    }
}

/// Partition plus the users that can be dragged onto it
#[derive(Debug, Clone)]
pub struct BuildSession {
    partition: Partition,
    users: Vec<UserRecord>,
}

impl BuildSession {
    pub fn new(limits: PartitionLimits) -> Self {
        Self {
            partition: Partition::new(limits),
            users: Vec::new(),
        }
    }

    /// Rebuild a session, re-checking every stored invariant
    pub fn from_state(state: BuildState, limits: PartitionLimits) -> Result<Self> {
        let partition = Partition::from_vessels(state.vessels, limits)?;
        let mut session = Self {
            partition,
            users: Vec::with_capacity(state.users.len()),
        };
        for user in state.users {
            session.add_user(user)?;
        }
        for vessel in session.partition.vessels() {
            for name in vessel.owner.iter().chain(vessel.users.iter()) {
                if session.user(name).is_none() {
                    return Err(ValidationError::UnknownUser(name.clone()).into());
                }
            }
        }
        Ok(session)
    }

    pub fn to_state(&self) -> BuildState {
        BuildState {
            vessels: self.partition.vessels().to_vec(),
            users: self.users.clone(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn user(&self, name: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Register a user; names are unique within a session
    pub fn add_user(&mut self, user: UserRecord) -> Result<()> {
        validation::validate_username(&user.name)?;
        if let Some(key) = &user.public_key {
            validation::validate_public_key(key)?;
        }
        if self.user(&user.name).is_some() {
            return Err(ValidationError::DuplicateUsername(user.name).into());
        }
        self.users.push(user);
        Ok(())
    }

    /// Drop a user and every tag they hold
    pub fn remove_user(&mut self, name: &str) -> Result<UserRecord> {
        let position = self
            .users
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| ValidationError::UnknownUser(name.to_string()))?;
        self.partition.forget_user(name);
        Ok(self.users.remove(position))
    }

    pub fn split(&mut self, at_offset: u32) -> Option<usize> {
        self.partition.split(at_offset)
    }

    pub fn remove_vessel(&mut self, index: usize) -> Result<Vessel> {
        Ok(self.partition.remove(index)?)
    }

    pub fn assign(&mut self, index: usize, role: Role, user: &str) -> Result<()> {
        if self.user(user).is_none() {
            return Err(ValidationError::UnknownUser(user.to_string()).into());
        }
        Ok(self.partition.assign(index, role, user)?)
    }

    pub fn clear_owner(&mut self, index: usize) -> Result<Option<String>> {
        Ok(self.partition.clear_owner(index)?)
    }

    pub fn remove_member(&mut self, index: usize, user: &str) -> Result<()> {
        Ok(self.partition.remove_member(index, user)?)
    }

    pub fn is_submittable(&self) -> bool {
        self.partition.is_submittable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::partition::PartitionError;
    use crate::Error;

    fn session_with_users(names: &[&str]) -> BuildSession {
        let mut session = BuildSession::new(PartitionLimits::default());
        for name in names {
            session.add_user(UserRecord::new(*name)).unwrap();
        }
        session
    }

    #[test]
    fn test_default_state_json_layout() {
        let state = BuildState::default_for(PartitionLimits::default());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "vessels": [{"percentage": 80, "owner": null, "users": []}],
                "users": [],
            })
        );
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let mut session = session_with_users(&["alex"]);
        let err = session.add_user(UserRecord::new("alex")).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateUsername(ref name)) if name == "alex"
        ));
        assert_eq!(session.users().len(), 1);
    }

    #[test]
    fn test_add_user_with_uploaded_key() {
        let mut session = BuildSession::new(PartitionLimits::default());
        let kp = KeyPair::generate();
        session
            .add_user(UserRecord::new("alex").with_public_key(kp.public_key_hex()))
            .unwrap();
        assert!(session
            .add_user(UserRecord::new("bill").with_public_key("not-a-key"))
            .is_err());
    }

    #[test]
    fn test_assign_requires_known_user() {
        let mut session = session_with_users(&["alex"]);
        assert!(session.assign(0, Role::Owner, "alex").is_ok());
        let err = session.assign(0, Role::Member, "ghost").unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownUser(_))));
    }

    #[test]
    fn test_duplicate_member_surfaces_partition_error() {
        let mut session = session_with_users(&["alex"]);
        session.assign(0, Role::Member, "alex").unwrap();
        let err = session.assign(0, Role::Member, "alex").unwrap_err();
        assert!(matches!(
            err,
            Error::Partition(PartitionError::DuplicateMember { index: 0, .. })
        ));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_remove_user_clears_tags() {
        let mut session = session_with_users(&["alex", "bill"]);
        session.split(40);
        session.assign(0, Role::Owner, "alex").unwrap();
        session.assign(1, Role::Member, "alex").unwrap();
        session.assign(1, Role::Owner, "bill").unwrap();

        session.remove_user("alex").unwrap();
        assert!(session.user("alex").is_none());
        assert!(session.partition().get(0).unwrap().owner.is_none());
        assert!(session.partition().get(1).unwrap().users.is_empty());
        assert!(session.remove_user("alex").is_err());
    }

    #[test]
    fn test_state_roundtrip_through_session() {
        let mut session = session_with_users(&["alex", "bill"]);
        session.split(30);
        session.assign(0, Role::Owner, "alex").unwrap();
        session.assign(1, Role::Owner, "bill").unwrap();
        session.assign(1, Role::Member, "alex").unwrap();

        let state = session.to_state();
        let restored = BuildSession::from_state(state.clone(), PartitionLimits::default()).unwrap();
        assert_eq!(restored.to_state(), state);
    }

    #[test]
    fn test_from_state_rejects_unknown_tags() {
        let state = BuildState {
            vessels: vec![Vessel::new(80).with_owner("ghost")],
            users: vec![],
        };
        assert!(BuildSession::from_state(state, PartitionLimits::default()).is_err());
    }

    #[test]
    fn test_from_state_rejects_bad_total() {
        let state = BuildState {
            vessels: vec![Vessel::new(60)],
            users: vec![],
        };
        let err = BuildSession::from_state(state, PartitionLimits::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::PercentageTotal { .. })
        ));
    }

    #[test]
    fn test_from_state_rejects_repeated_members() {
        let state = BuildState {
            vessels: vec![Vessel::new(80)
                .with_owner("alex")
                .with_user("bill")
                .with_user("bill")],
            users: vec![UserRecord::new("alex"), UserRecord::new("bill")],
        };
        let err = BuildSession::from_state(state, PartitionLimits::default()).unwrap_err();
        assert!(err.is_user_error());
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateVesselUser { index: 0, .. })
        ));
    }
}

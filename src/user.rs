use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::RecordId;
use crate::role::RoleId;
use crate::rule::{Permission, ResourceGeneric};

pub const USER_CLUSTER: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    pub fn identity(self) -> RecordId { RecordId::new(USER_CLUSTER, self.0 as i64) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<AccountStatus> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(AccountStatus::Active),
            "SUSPENDED" => Some(AccountStatus::Suspended),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Live principal record. Role references may dangle after a role is dropped.
#[derive(Debug, Clone)]
pub struct User {
    id: UserId,
    name: String,
    password_hash: String,
    status: AccountStatus,
    roles: Vec<RoleId>,
}

impl User {
    pub fn new<S: Into<String>>(id: UserId, name: S, password_hash: String) -> Self {
        Self { id, name: name.into(), password_hash, status: AccountStatus::Active, roles: Vec::new() }
    }

    pub fn id(&self) -> UserId { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn identity(&self) -> RecordId { self.id.identity() }
    pub fn password_hash(&self) -> &str { &self.password_hash }
    pub fn set_password_hash(&mut self, hash: String) { self.password_hash = hash; }
    pub fn status(&self) -> AccountStatus { self.status }
    pub fn set_status(&mut self, status: AccountStatus) { self.status = status; }
    pub fn is_active(&self) -> bool { self.status == AccountStatus::Active }

    pub fn roles(&self) -> &[RoleId] { &self.roles }
    pub fn has_role(&self, role: RoleId) -> bool { self.roles.contains(&role) }

    pub fn add_role(&mut self, role: RoleId) -> bool {
        if self.roles.contains(&role) { return false; }
        self.roles.push(role);
        true
    }

    pub fn remove_role(&mut self, role: RoleId) -> bool {
        let before = self.roles.len();
        self.roles.retain(|r| *r != role);
        before != self.roles.len()
    }
}

pub(crate) fn no_role_message(user: &str) -> String { format!("User '{}' has no role defined", user) }

pub(crate) fn denied_message(user: &str, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> String {
    let resource = match specific {
        Some(s) => format!("{}.{}", generic.legacy_name(), s),
        None => generic.legacy_name().to_string(),
    };
    format!("User '{}' does not have permission to execute the operation '{}' against the resource: {}", user, op.describe(), resource)
}

pub(crate) fn inactive_message(user: &str) -> String { format!("User '{}' is not active", user) }

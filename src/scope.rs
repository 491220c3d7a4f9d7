// src/scope.rs
//
// Role parsing and scope resolution: turns verified identity claims into the
// set of class ids a caller may aggregate over. Claims are validated into a
// typed grant exactly once, at the authorization boundary.

use std::collections::HashSet;

use tracing::debug;

use crate::store::{ClassDirectory, ClassId};
use crate::AppError;

/// The five-tier admin role hierarchy. Any other role string is rejected
/// outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRole {
    SuperAdmin,
    StateAdmin,
    BranchAdmin,
    ClassroomAdmin,
    ClassAdmin,
}

impl AdminRole {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "super_admin" => Ok(AdminRole::SuperAdmin),
            "state_admin" => Ok(AdminRole::StateAdmin),
            "branch_admin" => Ok(AdminRole::BranchAdmin),
            "classroom_admin" => Ok(AdminRole::ClassroomAdmin),
            "class_admin" => Ok(AdminRole::ClassAdmin),
            other => Err(AppError::ForbiddenRole(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdminRole::SuperAdmin => "super_admin",
            AdminRole::StateAdmin => "state_admin",
            AdminRole::BranchAdmin => "branch_admin",
            AdminRole::ClassroomAdmin => "classroom_admin",
            AdminRole::ClassAdmin => "class_admin",
        }
    }
}

/// A validated role + scope pair. Replaces the original free-form metadata
/// bag: once a grant exists, no call site re-parses scope claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeGrant {
    All,
    MainBranch(String),
    SubBranch(String),
    Classroom(String),
    Class(ClassId),
}

impl ScopeGrant {
    /// Builds a grant from verified claims. Every role below super admin
    /// needs a scope id; a class admin's scope must be a numeric class id.
    pub fn from_claims(role: AdminRole, scope_id: Option<&str>) -> Result<Self, AppError> {
        match role {
            AdminRole::SuperAdmin => Ok(ScopeGrant::All),
            AdminRole::StateAdmin => Ok(ScopeGrant::MainBranch(required_scope(scope_id)?)),
            AdminRole::BranchAdmin => Ok(ScopeGrant::SubBranch(required_scope(scope_id)?)),
            AdminRole::ClassroomAdmin => Ok(ScopeGrant::Classroom(required_scope(scope_id)?)),
            AdminRole::ClassAdmin => {
                let raw = required_scope(scope_id)?;
                let id = raw.parse::<ClassId>().map_err(|_| AppError::MissingScope)?;
                Ok(ScopeGrant::Class(id))
            }
        }
    }
}

fn required_scope(scope_id: Option<&str>) -> Result<String, AppError> {
    match scope_id {
        Some(raw) if !raw.trim().is_empty() => Ok(raw.trim().to_string()),
        _ => Err(AppError::MissingScope),
    }
}

/// The set of classes a grant resolves to. An empty id set is a valid
/// "no accessible classes" result, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassAccess {
    All,
    Ids(HashSet<ClassId>),
}

impl ClassAccess {
    /// Checks a requested class against the access set. `None` means the
    /// caller asked for "all", which is always permitted (the later fetch
    /// is still filtered to the access set).
    pub fn authorize(&self, requested: Option<ClassId>) -> Result<(), AppError> {
        match (self, requested) {
            (_, None) => Ok(()),
            (ClassAccess::All, Some(_)) => Ok(()),
            (ClassAccess::Ids(ids), Some(id)) => {
                if ids.contains(&id) {
                    Ok(())
                } else {
                    Err(AppError::ScopeViolation)
                }
            }
        }
    }

    /// The class-id filter for the raw-row fetch. `None` means unfiltered,
    /// which only the super-admin "all" request produces.
    pub fn filter_ids(&self, requested: Option<ClassId>) -> Option<Vec<ClassId>> {
        match (self, requested) {
            (ClassAccess::All, None) => None,
            (_, Some(id)) => Some(vec![id]),
            (ClassAccess::Ids(ids), None) => {
                let mut sorted: Vec<ClassId> = ids.iter().copied().collect();
                sorted.sort_unstable();
                Some(sorted)
            }
        }
    }
}

/// Resolves a grant to concrete class ids via the class directory. Directory
/// failures are fatal to the request; an empty result set is not.
pub async fn resolve_access(
    grant: &ScopeGrant,
    directory: &dyn ClassDirectory,
) -> Result<ClassAccess, AppError> {
    let access = match grant {
        ScopeGrant::All => ClassAccess::All,
        ScopeGrant::MainBranch(id) => {
            ClassAccess::Ids(directory.class_ids_by_main_branch(id).await?.into_iter().collect())
        }
        ScopeGrant::SubBranch(id) => {
            ClassAccess::Ids(directory.class_ids_by_sub_branch(id).await?.into_iter().collect())
        }
        ScopeGrant::Classroom(id) => {
            ClassAccess::Ids(directory.class_ids_by_classroom(id).await?.into_iter().collect())
        }
        // A class admin's scope *is* the class; no lookup involved.
        ScopeGrant::Class(id) => ClassAccess::Ids(HashSet::from([*id])),
    };
    debug!("Resolved scope grant {:?} to {:?}", grant, access);
    Ok(access)
}

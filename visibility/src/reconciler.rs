//! Pure reconciliation planning.
//!
//! These functions decide mapping deltas from prefetched state and never
//! touch a store or a broker, so the invariants are testable without either.
//! The service layer fetches the hierarchy closures and applies the plans.

use crate::error::{VisibilityError, VisibilityResult};
use iv_core::types::OrgId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result of planning a grant: the full post-grant mapping set and the
/// subset that is actually new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantPlan {
    pub target: BTreeSet<OrgId>,
    pub to_add: BTreeSet<OrgId>,
}

/// A revoke request entry that was skipped rather than applied. Non-fatal:
/// reported alongside the applied removals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRemoval {
    pub org_id: OrgId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokePlan {
    pub removed: BTreeSet<OrgId>,
    pub remaining: BTreeSet<OrgId>,
    pub rejected: Vec<RejectedRemoval>,
}

impl RevokePlan {
    /// True when the plan empties a previously non-empty mapping set,
    /// reverting the incident to unrestricted.
    pub fn becomes_unrestricted(&self, before: &BTreeSet<OrgId>) -> bool {
        !before.is_empty() && self.remaining.is_empty()
    }
}

/// Computes the mapping delta for a grant.
///
/// The target set is `before ∪ requested ∪ {owner}` expanded with the
/// transitive parent closure of every member: granting a child org
/// visibility always grants its ancestors too, so an org's visibility is a
/// superset of any descendant's. A grant never removes a mapping.
///
/// `ancestors` must hold the parent closure for every org in
/// `before ∪ requested ∪ {owner}`; orgs absent from the map are treated as
/// roots.
pub fn plan_grant(
    owner: &OrgId,
    before: &BTreeSet<OrgId>,
    requested: &BTreeSet<OrgId>,
    ancestors: &BTreeMap<OrgId, BTreeSet<OrgId>>,
) -> GrantPlan {
    let mut target: BTreeSet<OrgId> = before.union(requested).cloned().collect();
    // Owner injection: the owning org can never be locked out of a
    // restricted incident, whoever made the request.
    target.insert(owner.clone());

    let direct: Vec<OrgId> = target.iter().cloned().collect();
    for org in &direct {
        if let Some(parents) = ancestors.get(org) {
            target.extend(parents.iter().cloned());
        }
    }

    let to_add: BTreeSet<OrgId> = target.difference(before).cloned().collect();
    GrantPlan { target, to_add }
}

/// Computes the mapping delta for a revoke.
///
/// Requested orgs with no current mapping are skipped and reported. Fails
/// with `OwnerLockout` when the owner would lose its mapping while other
/// mappings survive. A removal is rejected per-item when the org is an
/// ancestor of another org that retains a mapping, since that descendant
/// still needs the inherited visibility.
///
/// `descendants` must hold the transitive descendant set for every
/// candidate removal (requested orgs that currently hold a mapping).
pub fn plan_revoke(
    incident_id: &str,
    owner: &OrgId,
    before: &BTreeSet<OrgId>,
    requested: &BTreeSet<OrgId>,
    descendants: &BTreeMap<OrgId, BTreeSet<OrgId>>,
) -> VisibilityResult<RevokePlan> {
    let mut rejected = Vec::new();

    let candidates: BTreeSet<OrgId> = requested.intersection(before).cloned().collect();
    for org in requested.difference(before) {
        rejected.push(RejectedRemoval {
            org_id: org.clone(),
            reason: "organization has no visibility mapping for this incident".to_string(),
        });
    }

    // The owner may only lose access when the request clears every
    // remaining mapping, reverting the incident to unrestricted.
    let retained_if_applied: BTreeSet<OrgId> = before.difference(&candidates).cloned().collect();
    if candidates.contains(owner) && !retained_if_applied.is_empty() {
        return Err(VisibilityError::OwnerLockout {
            incident_id: incident_id.to_string(),
            owner_org_id: owner.as_str().to_string(),
        });
    }

    // One pass over transitive closures: a candidate is kept out of the
    // removal set iff some org outside the requested removals (and thus
    // guaranteed to retain a mapping) descends from it.
    let mut removed = BTreeSet::new();
    for org in &candidates {
        let blocking: Option<&OrgId> = descendants
            .get(org)
            .and_then(|desc| desc.intersection(&retained_if_applied).next());

        match blocking {
            Some(child) => rejected.push(RejectedRemoval {
                org_id: org.clone(),
                reason: format!(
                    "organization {} still holds a mapping inherited through this parent",
                    child
                ),
            }),
            None => {
                removed.insert(org.clone());
            }
        }
    }

    let remaining: BTreeSet<OrgId> = before.difference(&removed).cloned().collect();
    Ok(RevokePlan {
        removed,
        remaining,
        rejected,
    })
}

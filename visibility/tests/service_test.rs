//! Service-level tests against in-memory ports. The store fake honors the
//! per-incident lock contract with async mutexes, so the lock discipline is
//! exercised too.

use async_trait::async_trait;
use dashmap::DashMap;
use iv_core::types::{Incident, IncidentId, OrgId, UserId, VisibilityEvent, WorkspaceId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use visibility::{
    NotificationGateway, OrgHierarchy, VisibilityConfig, VisibilityError, VisibilityResult,
    VisibilityService, VisibilityStore,
};

struct InMemoryHierarchy {
    // Direct parent edges; closures are computed by walking.
    parents: HashMap<OrgId, BTreeSet<OrgId>>,
}

impl InMemoryHierarchy {
    fn new(edges: &[(&str, &str)]) -> Self {
        let mut parents: HashMap<OrgId, BTreeSet<OrgId>> = HashMap::new();
        for (child, parent) in edges {
            parents
                .entry(child.parse().unwrap())
                .or_default()
                .insert(parent.parse().unwrap());
        }
        Self { parents }
    }
}

#[async_trait]
impl OrgHierarchy for InMemoryHierarchy {
    async fn get_parents(&self, org_id: &OrgId) -> VisibilityResult<BTreeSet<OrgId>> {
        let mut closure = BTreeSet::new();
        let mut frontier = vec![org_id.clone()];
        while let Some(org) = frontier.pop() {
            if let Some(direct) = self.parents.get(&org) {
                for parent in direct {
                    if closure.insert(parent.clone()) {
                        frontier.push(parent.clone());
                    }
                }
            }
        }
        Ok(closure)
    }

    async fn get_children(&self, org_ids: &BTreeSet<OrgId>) -> VisibilityResult<BTreeSet<OrgId>> {
        let mut closure = BTreeSet::new();
        let mut frontier: Vec<OrgId> = org_ids.iter().cloned().collect();
        while let Some(org) = frontier.pop() {
            for (child, direct) in &self.parents {
                if direct.contains(&org) && closure.insert(child.clone()) {
                    frontier.push(child.clone());
                }
            }
        }
        Ok(closure)
    }
}

#[derive(Default)]
struct InMemoryStore {
    incidents: HashMap<IncidentId, Incident>,
    workspace_orgs: HashMap<WorkspaceId, BTreeSet<OrgId>>,
    mappings: Mutex<HashMap<IncidentId, BTreeSet<OrgId>>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    held: DashMap<String, tokio::sync::OwnedMutexGuard<()>>,
}

impl InMemoryStore {
    fn with_incident(incident: Incident, workspace_orgs: &[&str]) -> Self {
        let store = Self::default();
        let mut incidents = HashMap::new();
        let mut workspaces = HashMap::new();
        workspaces.insert(
            incident.workspace_id.clone(),
            workspace_orgs.iter().map(|o| o.parse().unwrap()).collect(),
        );
        incidents.insert(incident.id.clone(), incident);
        Self {
            incidents,
            workspace_orgs: workspaces,
            ..store
        }
    }

    fn mappings_for(&self, incident_id: &IncidentId) -> BTreeSet<OrgId> {
        self.mappings
            .lock()
            .unwrap()
            .get(incident_id)
            .cloned()
            .unwrap_or_default()
    }

    fn seed_mappings(&self, incident_id: &IncidentId, orgs: &[&str]) {
        self.mappings.lock().unwrap().insert(
            incident_id.clone(),
            orgs.iter().map(|o| o.parse().unwrap()).collect(),
        );
    }
}

#[async_trait]
impl VisibilityStore for InMemoryStore {
    async fn get_incident(&self, incident_id: &IncidentId) -> VisibilityResult<Incident> {
        self.incidents
            .get(incident_id)
            .cloned()
            .ok_or_else(|| VisibilityError::IncidentNotFound(incident_id.as_str().to_string()))
    }

    async fn get_mappings(&self, incident_id: &IncidentId) -> VisibilityResult<BTreeSet<OrgId>> {
        Ok(self.mappings_for(incident_id))
    }

    async fn add_mapping(&self, incident_id: &IncidentId, org_id: &OrgId) -> VisibilityResult<()> {
        self.mappings
            .lock()
            .unwrap()
            .entry(incident_id.clone())
            .or_default()
            .insert(org_id.clone());
        Ok(())
    }

    async fn remove_mapping(
        &self,
        incident_id: &IncidentId,
        org_id: &OrgId,
    ) -> VisibilityResult<()> {
        let mut mappings = self.mappings.lock().unwrap();
        if let Some(set) = mappings.get_mut(incident_id) {
            set.remove(org_id);
            if set.is_empty() {
                mappings.remove(incident_id);
            }
        }
        Ok(())
    }

    async fn list_workspace_orgs(
        &self,
        workspace_id: &WorkspaceId,
    ) -> VisibilityResult<BTreeSet<OrgId>> {
        Ok(self
            .workspace_orgs
            .get(workspace_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn lock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()> {
        let mutex = self
            .locks
            .entry(incident_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        self.held.insert(incident_id.as_str().to_string(), guard);
        Ok(())
    }

    async fn unlock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()> {
        self.held
            .remove(incident_id.as_str())
            .map(|_| ())
            .ok_or_else(|| {
                VisibilityError::Storage(format!("no lock held for incident {incident_id}"))
            })
    }
}

#[derive(Default)]
struct RecordingGateway {
    events: Mutex<Vec<(String, VisibilityEvent)>>,
    fail: AtomicBool,
}

impl RecordingGateway {
    fn events(&self) -> Vec<(String, VisibilityEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn publish(&self, topic: &str, event: &VisibilityEvent) -> VisibilityResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VisibilityError::Publish("broker unreachable".to_string()));
        }
        self.events
            .lock()
            .unwrap()
            .push((topic.to_string(), event.clone()));
        Ok(())
    }
}

fn incident(id: &str, owner: &str) -> Incident {
    Incident {
        id: id.parse().unwrap(),
        name: Some("wildfire".to_string()),
        workspace_id: "ws-1".parse().unwrap(),
        owner_org_id: owner.parse().unwrap(),
        created_at: 0,
    }
}

fn orgs(ids: &[&str]) -> BTreeSet<OrgId> {
    ids.iter().map(|id| id.parse().unwrap()).collect()
}

fn user() -> UserId {
    "user-1".parse().unwrap()
}

struct Harness {
    service: VisibilityService,
    store: Arc<InMemoryStore>,
    gateway: Arc<RecordingGateway>,
}

// Hierarchy used throughout: 0 <- 1 <- {2, 3}, org 9 standalone.
fn harness(config: VisibilityConfig) -> Harness {
    let hierarchy = Arc::new(InMemoryHierarchy::new(&[
        ("1", "0"),
        ("2", "1"),
        ("3", "1"),
    ]));
    let store = Arc::new(InMemoryStore::with_incident(
        incident("inc-1", "1"),
        &["0", "1", "2", "3", "9"],
    ));
    let gateway = Arc::new(RecordingGateway::default());
    let service = VisibilityService::new(config, hierarchy, store.clone(), gateway.clone());
    Harness {
        service,
        store,
        gateway,
    }
}

#[tokio::test]
async fn test_grant_expands_ancestors_and_notifies_added_only() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();

    let report = h
        .service
        .grant_access(&incident_id, &orgs(&["2"]), &"2".parse().unwrap(), &user())
        .await
        .unwrap();

    assert_eq!(report.mappings, orgs(&["0", "1", "2"]));
    assert_eq!(report.added, orgs(&["0", "1", "2"]));
    assert_eq!(h.store.mappings_for(&incident_id), orgs(&["0", "1", "2"]));

    let events = h.gateway.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "visibility:events:ws-1");
    match &events[0].1 {
        VisibilityEvent::AccessGranted { org_ids, .. } => {
            assert_eq!(*org_ids, orgs(&["0", "1", "2"]));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_grant_is_idempotent_and_silent_on_repeat() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    let requester: OrgId = "1".parse().unwrap();

    let first = h
        .service
        .grant_access(&incident_id, &orgs(&["2"]), &requester, &user())
        .await
        .unwrap();
    let second = h
        .service
        .grant_access(&incident_id, &orgs(&["2"]), &requester, &user())
        .await
        .unwrap();

    assert_eq!(second.mappings, first.mappings);
    assert!(second.added.is_empty());
    // No second notification when nothing changed.
    assert_eq!(h.gateway.events().len(), 1);
}

#[tokio::test]
async fn test_grant_rejects_empty_request() {
    let h = harness(VisibilityConfig::default());
    let result = h
        .service
        .grant_access(
            &"inc-1".parse().unwrap(),
            &BTreeSet::new(),
            &"1".parse().unwrap(),
            &user(),
        )
        .await;

    assert!(matches!(result, Err(VisibilityError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_grant_unknown_incident() {
    let h = harness(VisibilityConfig::default());
    let result = h
        .service
        .grant_access(
            &"inc-missing".parse().unwrap(),
            &orgs(&["2"]),
            &"1".parse().unwrap(),
            &user(),
        )
        .await;

    assert!(matches!(result, Err(VisibilityError::IncidentNotFound(_))));
}

#[tokio::test]
async fn test_revoke_owner_lockout_leaves_state_untouched() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    h.store.seed_mappings(&incident_id, &["1", "9"]);

    let result = h
        .service
        .revoke_access(&incident_id, &orgs(&["1"]), &user())
        .await;

    assert!(matches!(result, Err(VisibilityError::OwnerLockout { .. })));
    assert_eq!(h.store.mappings_for(&incident_id), orgs(&["1", "9"]));
    assert!(h.gateway.events().is_empty());

    // Lock must have been released despite the error.
    let retry = h
        .service
        .revoke_access(&incident_id, &orgs(&["9"]), &user())
        .await
        .unwrap();
    assert_eq!(retry.removed, orgs(&["9"]));
}

#[tokio::test]
async fn test_revoke_parent_with_mapped_child_is_rejected_per_item() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    h.store.seed_mappings(&incident_id, &["0", "1", "2"]);

    let report = h
        .service
        .revoke_access(&incident_id, &orgs(&["0"]), &user())
        .await
        .unwrap();

    assert!(report.removed.is_empty());
    assert!(report.has_rejections());
    assert_eq!(report.rejected[0].org_id, "0".parse::<OrgId>().unwrap());
    assert_eq!(h.store.mappings_for(&incident_id), orgs(&["0", "1", "2"]));
    assert!(h.gateway.events().is_empty());
}

#[tokio::test]
async fn test_revoke_last_mapping_broadcasts_unrestricted() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    h.store.seed_mappings(&incident_id, &["1"]);

    let report = h
        .service
        .revoke_access(&incident_id, &orgs(&["1"]), &user())
        .await
        .unwrap();

    assert!(report.unrestricted);
    assert!(report.remaining.is_empty());
    assert!(h.store.mappings_for(&incident_id).is_empty());

    let events = h.gateway.events();
    assert_eq!(events.len(), 1);
    match &events[0].1 {
        VisibilityEvent::IncidentUnrestricted { org_ids, .. } => {
            // Broadcast carries every org in the workspace.
            assert_eq!(*org_ids, orgs(&["0", "1", "2", "3", "9"]));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_revoke_notifies_removed_with_remaining_set() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    h.store.seed_mappings(&incident_id, &["0", "1", "9"]);

    let report = h
        .service
        .revoke_access(&incident_id, &orgs(&["9"]), &user())
        .await
        .unwrap();

    assert_eq!(report.removed, orgs(&["9"]));
    assert_eq!(report.remaining, orgs(&["0", "1"]));

    let events = h.gateway.events();
    assert_eq!(events.len(), 1);
    match &events[0].1 {
        VisibilityEvent::AccessRevoked {
            removed_org_ids,
            remaining_org_ids,
            ..
        } => {
            assert_eq!(*removed_org_ids, orgs(&["9"]));
            assert_eq!(*remaining_org_ids, orgs(&["0", "1"]));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_failure_never_rolls_back_persisted_mappings() {
    let h = harness(VisibilityConfig::default());
    let incident_id: IncidentId = "inc-1".parse().unwrap();
    h.gateway.fail.store(true, Ordering::SeqCst);

    let report = h
        .service
        .grant_access(&incident_id, &orgs(&["2"]), &"2".parse().unwrap(), &user())
        .await
        .unwrap();

    assert_eq!(report.added, orgs(&["0", "1", "2"]));
    assert_eq!(h.store.mappings_for(&incident_id), orgs(&["0", "1", "2"]));
}

#[tokio::test]
async fn test_dry_run_plans_without_side_effects() {
    let config = VisibilityConfig {
        dry_run: true,
        ..VisibilityConfig::default()
    };
    let h = harness(config);
    let incident_id: IncidentId = "inc-1".parse().unwrap();

    let report = h
        .service
        .grant_access(&incident_id, &orgs(&["2"]), &"2".parse().unwrap(), &user())
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.added, orgs(&["0", "1", "2"]));
    assert!(h.store.mappings_for(&incident_id).is_empty());
    assert!(h.gateway.events().is_empty());
}

#[tokio::test]
async fn test_concurrent_grants_serialize_per_incident() {
    let h = harness(VisibilityConfig::default());
    let service = Arc::new(h.service);
    let incident_id: IncidentId = "inc-1".parse().unwrap();

    let mut handles = Vec::new();
    for org in ["2", "3", "9"] {
        let service = service.clone();
        let incident_id = incident_id.clone();
        handles.push(tokio::spawn(async move {
            service
                .grant_access(&incident_id, &orgs(&[org]), &org.parse().unwrap(), &user())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        h.store.mappings_for(&incident_id),
        orgs(&["0", "1", "2", "3", "9"])
    );
}

use std::collections::HashSet;

use async_trait::async_trait;
use tender_core::{
    DedupPlan, Employee, EmployeeAssignment, Organisation, OrganisationLink, Pseudonym,
    RowMutation, Tender,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{EntityStore, MutationReceipt, StoreError, StoreSnapshot};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tenders: Vec<Tender>,
    organisations: Vec<Organisation>,
    employees: Vec<Employee>,
}

impl MemoryState {
    fn tender_mut(&mut self, id: Uuid) -> Result<&mut Tender, StoreError> {
        self.tenders
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound {
                entity: "tender",
                id,
            })
    }

    fn organisation_named(&self, name: &str) -> Option<&Organisation> {
        self.organisations.iter().find(|o| o.name == name)
    }

    fn link(&mut self, tender_id: Uuid, name: &str, role: &str) -> Result<(OrganisationLink, bool), StoreError> {
        let (organisation, created) = match self.organisation_named(name) {
            Some(existing) => (existing.clone(), false),
            None => {
                let organisation = Organisation {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                };
                self.organisations.push(organisation.clone());
                (organisation, true)
            }
        };
        let tender = self.tender_mut(tender_id)?;
        if tender.organisations.iter().any(|l| l.role == role) {
            return Err(StoreError::Constraint(format!(
                "tender {tender_id} already has an organisation with role {role}"
            )));
        }
        let link = OrganisationLink {
            id: Uuid::new_v4(),
            organisation_id: organisation.id,
            organisation_name: organisation.name,
            role: role.to_string(),
        };
        tender.organisations.push(link.clone());
        Ok((link, created))
    }

    fn assign(&mut self, tender_id: Uuid, employee_id: Uuid, role: &str) -> Result<EmployeeAssignment, StoreError> {
        let employee = self
            .employees
            .iter()
            .find(|e| e.id == employee_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "employee",
                id: employee_id,
            })?;
        let assignment = EmployeeAssignment {
            id: Uuid::new_v4(),
            employee_id: employee.id,
            pseudonym: employee.pseudonym,
            role: role.to_string(),
        };
        self.tender_mut(tender_id)?.employees.push(assignment.clone());
        Ok(assignment)
    }
}

/// In-process store with whole-state copy-on-write transactions.
///
/// Used by tests and dry runs; failure injection covers the row-fatal and
/// batch-fatal paths of the driver.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    state: Mutex<MemoryState>,
    unavailable: Mutex<bool>,
    failing_tenders: Mutex<HashSet<Uuid>>,
    committed_writes: Mutex<usize>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tender(&self, tender: Tender) -> Uuid {
        let id = tender.id;
        self.state.lock().await.tenders.push(tender);
        id
    }

    pub async fn insert_employee(&self, pseudonym: Pseudonym, display_name: Option<&str>) -> Employee {
        let employee = Employee {
            id: Uuid::new_v4(),
            pseudonym,
            display_name: display_name.map(ToString::to_string),
        };
        self.state.lock().await.employees.push(employee.clone());
        employee
    }

    pub async fn link_organisation(
        &self,
        tender_id: Uuid,
        organisation_name: &str,
        role: &str,
    ) -> Result<OrganisationLink, StoreError> {
        let mut state = self.state.lock().await;
        state
            .link(tender_id, organisation_name, role)
            .map(|(link, _)| link)
    }

    /// Seed an assignment with an arbitrary (possibly historical) role label.
    pub async fn assign_employee(
        &self,
        tender_id: Uuid,
        employee_id: Uuid,
        role: &str,
    ) -> Result<EmployeeAssignment, StoreError> {
        self.state.lock().await.assign(tender_id, employee_id, role)
    }

    pub async fn tender(&self, id: Uuid) -> Option<Tender> {
        self.state
            .lock()
            .await
            .tenders
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn organisation_count(&self) -> usize {
        self.state.lock().await.organisations.len()
    }

    /// Number of committed transactions that changed state.
    pub async fn committed_writes(&self) -> usize {
        *self.committed_writes.lock().await
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    /// Make every mutation touching `tender_id` fail with a constraint error.
    pub async fn fail_mutations_for(&self, tender_id: Uuid) {
        self.failing_tenders.lock().await.insert(tender_id);
    }

    async fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock().await {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    async fn check_injected_failure(&self, tender_id: Uuid) -> Result<(), StoreError> {
        if self.failing_tenders.lock().await.contains(&tender_id) {
            Err(StoreError::Constraint(format!(
                "injected failure for tender {tender_id}"
            )))
        } else {
            Ok(())
        }
    }

    /// Swap in the new state while the caller still holds the state lock.
    async fn commit(&self, state: &mut MemoryState, next: MemoryState) {
        *state = next;
        *self.committed_writes.lock().await += 1;
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn load_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        self.check_available().await?;
        let state = self.state.lock().await;
        Ok(StoreSnapshot {
            tenders: state.tenders.clone(),
            employees: state.employees.clone(),
        })
    }

    async fn find_organisation_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Organisation>, StoreError> {
        self.check_available().await?;
        Ok(self.state.lock().await.organisation_named(name).cloned())
    }

    async fn apply_row_mutation(
        &self,
        mutation: &RowMutation,
    ) -> Result<MutationReceipt, StoreError> {
        self.check_available().await?;
        self.check_injected_failure(mutation.tender_id).await?;
        if mutation.is_empty() {
            return Ok(MutationReceipt::default());
        }

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut receipt = MutationReceipt::default();

        next.tender_mut(mutation.tender_id)?
            .apply_update(&mutation.update)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        receipt.fields_written = mutation.update.len();

        if let Some(link) = &mutation.new_organisation_link {
            let (_, created) = next.link(mutation.tender_id, &link.organisation_name, &link.role)?;
            receipt.organisation_created = created;
            receipt.organisation_link_created = true;
        }

        for assignment in &mutation.new_assignments {
            next.assign(mutation.tender_id, assignment.employee_id, &assignment.role)?;
            receipt.assignments_created += 1;
        }

        self.commit(&mut state, next).await;
        Ok(receipt)
    }

    async fn apply_dedup_plan(&self, tender_id: Uuid, plan: &DedupPlan) -> Result<(), StoreError> {
        self.check_available().await?;
        self.check_injected_failure(tender_id).await?;
        if plan.is_noop() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let tender = next.tender_mut(tender_id)?;
        for id in &plan.delete {
            let before = tender.employees.len();
            tender.employees.retain(|a| a.id != *id);
            if tender.employees.len() == before {
                return Err(StoreError::NotFound {
                    entity: "employee assignment",
                    id: *id,
                });
            }
        }
        for relabel in &plan.relabel {
            let assignment = tender
                .employees
                .iter_mut()
                .find(|a| a.id == relabel.assignment_id)
                .ok_or(StoreError::NotFound {
                    entity: "employee assignment",
                    id: relabel.assignment_id,
                })?;
            assignment.role = relabel.role.clone();
        }

        self.commit(&mut state, next).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tender_core::{
        FieldUpdate, FieldValue, NewAssignment, NewOrganisationLink, PseudonymPolicy, TenderField,
        CUSTOMER_ROLE,
    };

    fn pseudonym(code: &str) -> Pseudonym {
        Pseudonym::parse(code, &PseudonymPolicy::default()).expect("valid pseudonym")
    }

    #[tokio::test]
    async fn row_mutation_is_all_or_nothing() {
        let store = MemoryEntityStore::new();
        let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
        let mut update = FieldUpdate::new();
        update.set(TenderField::Notes, None, FieldValue::Text("ISO 27001 Audit".into()));

        let mutation = RowMutation {
            tender_id,
            update,
            new_assignments: vec![NewAssignment {
                employee_id: Uuid::new_v4(),
                pseudonym: pseudonym("KBR"),
                role: "Opp Partner".into(),
            }],
            new_organisation_link: Some(NewOrganisationLink {
                organisation_name: "Acme GmbH".into(),
                role: CUSTOMER_ROLE.into(),
            }),
        };

        let err = store.apply_row_mutation(&mutation).await.expect_err("unknown employee");
        assert!(matches!(err, StoreError::NotFound { entity: "employee", .. }));

        let tender = store.tender(tender_id).await.expect("tender");
        assert_eq!(tender.notes, None);
        assert!(tender.organisations.is_empty());
        assert_eq!(store.organisation_count().await, 0);
        assert_eq!(store.committed_writes().await, 0);
    }

    #[tokio::test]
    async fn second_customer_link_violates_constraint() {
        let store = MemoryEntityStore::new();
        let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
        store
            .link_organisation(tender_id, "Acme GmbH", CUSTOMER_ROLE)
            .await
            .expect("first link");
        let err = store
            .link_organisation(tender_id, "Other AG", CUSTOMER_ROLE)
            .await
            .expect_err("second link");
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn dedup_plan_deletes_and_relabels() {
        let store = MemoryEntityStore::new();
        let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
        let kbr = store.insert_employee(pseudonym("KBR"), None).await;
        let a = store.assign_employee(tender_id, kbr.id, "Lead Vertrieb").await.expect("a");
        let b = store.assign_employee(tender_id, kbr.id, "OPP-Partner").await.expect("b");

        let plan = DedupPlan {
            keep: vec![b.id],
            delete: vec![a.id],
            relabel: vec![tender_core::Relabel {
                assignment_id: b.id,
                role: "Opp Partner".into(),
            }],
        };
        store.apply_dedup_plan(tender_id, &plan).await.expect("apply");

        let tender = store.tender(tender_id).await.expect("tender");
        assert_eq!(tender.employees.len(), 1);
        assert_eq!(tender.employees[0].role, "Opp Partner");
    }

    #[tokio::test]
    async fn organisation_lookup_matches_exact_name() {
        let store = MemoryEntityStore::new();
        let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
        let link = store
            .link_organisation(tender_id, "Acme GmbH", CUSTOMER_ROLE)
            .await
            .expect("link");

        let found = store
            .find_organisation_by_name("Acme GmbH")
            .await
            .expect("lookup")
            .expect("organisation");
        assert_eq!(found.id, link.organisation_id);
        assert!(store.find_organisation_by_name("Beta AG").await.expect("lookup").is_none());

        store.set_unavailable(true).await;
        assert!(store.find_organisation_by_name("Acme GmbH").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_all_land() {
        let store = std::sync::Arc::new(MemoryEntityStore::new());
        let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
        let codes = ["ABC", "BCD", "CDE", "DEF", "EFG", "FGH", "GHI", "HIJ"];
        let mut employees = Vec::new();
        for code in codes {
            employees.push(store.insert_employee(pseudonym(code), None).await);
        }

        let handles = employees
            .into_iter()
            .map(|employee| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mutation = RowMutation {
                        tender_id,
                        update: FieldUpdate::new(),
                        new_assignments: vec![NewAssignment {
                            employee_id: employee.id,
                            pseudonym: employee.pseudonym,
                            role: "Opp Partner".into(),
                        }],
                        new_organisation_link: None,
                    };
                    store.apply_row_mutation(&mutation).await
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.expect("join").expect("mutation");
        }

        let tender = store.tender(tender_id).await.expect("tender");
        assert_eq!(tender.employees.len(), codes.len());
        assert_eq!(store.committed_writes().await, codes.len());
    }

    #[tokio::test]
    async fn unavailable_store_refuses_snapshot() {
        let store = MemoryEntityStore::new();
        store.set_unavailable(true).await;
        let err = store.load_snapshot().await.expect_err("offline");
        assert!(err.is_batch_fatal());
    }
}

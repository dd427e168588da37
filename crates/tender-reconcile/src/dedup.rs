//! Assignment deduplication: one assignment per employee and canonical role.

use std::collections::HashSet;

use serde::Serialize;
use tender_core::{DedupPlan, EmployeeAssignment, Relabel};
use uuid::Uuid;

use crate::normalize::{canonical_role, is_canonical_role};

/// Aggregate result of one dedup pass over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub dry_run: bool,
    pub tenders_scanned: usize,
    pub tenders_changed: usize,
    pub duplicate_groups: usize,
    pub assignments_deleted: usize,
    pub assignments_relabeled: usize,
    pub failures: Vec<DedupFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupFailure {
    pub tender_id: Uuid,
    pub error: String,
}

/// Groups in first-appearance order.
fn group_by<'a, K: PartialEq>(
    assignments: &'a [EmployeeAssignment],
    key: impl Fn(&'a EmployeeAssignment) -> K,
) -> Vec<(K, Vec<&'a EmployeeAssignment>)> {
    let mut groups: Vec<(K, Vec<&EmployeeAssignment>)> = Vec::new();
    for assignment in assignments {
        let k = key(assignment);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, members)) => members.push(assignment),
            None => groups.push((k, vec![assignment])),
        }
    }
    groups
}

/// Number of (employee, canonical role) clusters holding more than one
/// assignment.
pub fn duplicate_group_count(assignments: &[EmployeeAssignment]) -> usize {
    group_by(assignments, |a| (a.employee_id, canonical_role(&a.role)))
        .iter()
        .filter(|(_, members)| members.len() > 1)
        .count()
}

/// Plan the dedup of one tender's assignments.
///
/// Per employee, assignments are grouped by their raw role label. The first
/// assignment of each group is its representative; the rest are deleted. A
/// representative with a historical label is relabeled to the canonical role
/// unless the employee already holds that role, in which case it is deleted.
/// Applying the plan and planning again yields a no-op.
pub fn plan_dedup(assignments: &[EmployeeAssignment]) -> DedupPlan {
    let mut plan = DedupPlan::default();

    for (_, held) in group_by(assignments, |a| a.employee_id) {
        let mut labels: Vec<(&str, Vec<&EmployeeAssignment>)> = Vec::new();
        for assignment in held {
            match labels.iter_mut().find(|(label, _)| *label == assignment.role) {
                Some((_, members)) => members.push(assignment),
                None => labels.push((assignment.role.as_str(), vec![assignment])),
            }
        }

        let mut claimed: HashSet<&str> = labels.iter().map(|(label, _)| *label).collect();
        for (label, members) in labels {
            let (representative, surplus) = match members.split_first() {
                Some(split) => split,
                None => continue,
            };
            plan.delete.extend(surplus.iter().map(|a| a.id));

            let canonical = canonical_role(label);
            if is_canonical_role(label) || !is_canonical_role(canonical) {
                plan.keep.push(representative.id);
            } else if claimed.contains(canonical) {
                plan.delete.push(representative.id);
            } else {
                claimed.insert(canonical);
                plan.keep.push(representative.id);
                plan.relabel.push(Relabel {
                    assignment_id: representative.id,
                    role: canonical.to_string(),
                });
            }
        }
    }

    plan
}

/// Apply a plan to an in-memory assignment list.
pub fn apply_plan(assignments: &[EmployeeAssignment], plan: &DedupPlan) -> Vec<EmployeeAssignment> {
    let deleted: HashSet<Uuid> = plan.delete.iter().copied().collect();
    assignments
        .iter()
        .filter(|a| !deleted.contains(&a.id))
        .map(|a| {
            let mut a = a.clone();
            if let Some(relabel) = plan.relabel.iter().find(|r| r.assignment_id == a.id) {
                a.role = relabel.role.clone();
            }
            a
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tender_core::{roles, Pseudonym, PseudonymPolicy};

    struct Fixture {
        assignments: Vec<EmployeeAssignment>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                assignments: Vec::new(),
            }
        }

        fn add(&mut self, employee_id: Uuid, code: &str, role: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.assignments.push(EmployeeAssignment {
                id,
                employee_id,
                pseudonym: Pseudonym::parse(code, &PseudonymPolicy::default()).expect("pseudonym"),
                role: role.to_string(),
            });
            id
        }
    }

    #[test]
    fn exact_duplicates_keep_the_first() {
        let kbr = Uuid::new_v4();
        let mut f = Fixture::new();
        let first = f.add(kbr, "KBR", roles::OPP_PARTNER);
        let second = f.add(kbr, "KBR", roles::OPP_PARTNER);
        let third = f.add(kbr, "KBR", roles::OPP_PARTNER);

        let plan = plan_dedup(&f.assignments);
        assert_eq!(plan.keep, vec![first]);
        assert_eq!(plan.delete, vec![second, third]);
        assert!(plan.relabel.is_empty());
        assert_eq!(duplicate_group_count(&f.assignments), 1);
    }

    #[test]
    fn lone_alias_is_relabeled() {
        let mue = Uuid::new_v4();
        let mut f = Fixture::new();
        let only = f.add(mue, "MUE", "Lead Vertrieb");

        let plan = plan_dedup(&f.assignments);
        assert_eq!(plan.keep, vec![only]);
        assert!(plan.delete.is_empty());
        assert_eq!(
            plan.relabel,
            vec![Relabel {
                assignment_id: only,
                role: roles::SALES_LEAD.to_string()
            }]
        );
    }

    #[test]
    fn alias_is_deleted_when_canonical_role_is_held() {
        let mue = Uuid::new_v4();
        let mut f = Fixture::new();
        let alias = f.add(mue, "MUE", "Lead Vertrieb");
        let canonical = f.add(mue, "MUE", roles::SALES_LEAD);

        let plan = plan_dedup(&f.assignments);
        assert_eq!(plan.keep, vec![canonical]);
        assert_eq!(plan.delete, vec![alias]);
        assert!(plan.relabel.is_empty());
        assert_eq!(duplicate_group_count(&f.assignments), 1);
    }

    #[test]
    fn two_aliases_of_one_role_collapse_to_one() {
        let kbr = Uuid::new_v4();
        let mut f = Fixture::new();
        let a = f.add(kbr, "KBR", "OPP-Partner");
        let b = f.add(kbr, "KBR", "Opportunity Partner");
        let c = f.add(kbr, "KBR", "OPP-Partner");

        let plan = plan_dedup(&f.assignments);
        assert_eq!(plan.keep, vec![a]);
        assert_eq!(plan.delete, vec![c, b]);
        assert_eq!(plan.relabel.len(), 1);
    }

    #[test]
    fn different_employees_and_roles_are_independent() {
        let kbr = Uuid::new_v4();
        let mue = Uuid::new_v4();
        let mut f = Fixture::new();
        f.add(kbr, "KBR", roles::OPP_PARTNER);
        f.add(kbr, "KBR", roles::TECHNICAL_LEAD);
        f.add(mue, "MUE", roles::OPP_PARTNER);
        f.add(mue, "MUE", "Projektleitung");

        assert!(plan_dedup(&f.assignments).is_noop());
        assert_eq!(duplicate_group_count(&f.assignments), 0);
    }

    #[test]
    fn one_pass_converges() {
        let kbr = Uuid::new_v4();
        let mue = Uuid::new_v4();
        let mut f = Fixture::new();
        f.add(kbr, "KBR", "OPP-Partner");
        f.add(kbr, "KBR", roles::OPP_PARTNER);
        f.add(kbr, "KBR", "OPP-Partner");
        f.add(mue, "MUE", "Lead Vertrieb");
        f.add(mue, "MUE", "Vertriebslead");
        f.add(mue, "MUE", "Fachlicher Lead");
        f.add(mue, "MUE", roles::TECHNICAL_LEAD);
        f.add(mue, "MUE", "Lead Vertrieb");

        let once = apply_plan(&f.assignments, &plan_dedup(&f.assignments));
        assert!(plan_dedup(&once).is_noop());
        assert_eq!(duplicate_group_count(&once), 0);
        assert_eq!(once.len(), 3);
        assert!(once
            .iter()
            .all(|a| roles::CANONICAL.contains(&a.role.as_str())));
    }
}

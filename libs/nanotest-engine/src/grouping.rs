/// Device Equivalence Grouping
///
/// **Core Responsibility:**
/// Given the available devices and a test's resolved predicate, decide which
/// devices must run the test so that every equivalence class is covered once.
///
/// **Algorithm:**
/// - Drop devices whose `should_run` is false or errors
/// - Walk the rest in input order; a device joins the first class whose
///   representative it is equivalent to, otherwise it founds a new class
/// - Representatives are scheduled, everyone else is redundant
///
/// A failing `are_equivalent(rep, device)` only means "not known to be
/// equivalent"; the device keeps being compared with later classes.
/// Equivalence is not required to be transitive, in which case the result
/// depends on the input order.
use nanotest_common::device::{Device, DeviceId};
use nanotest_common::predicate::{PredicateError, ResolvedPredicate};
use nanotest_common::types::{Outcome, OutcomeReport, TestCase};
use tracing::warn;

/// A predicate call that failed during grouping
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateFault {
    pub device: DeviceId,
    /// Representative the device was being compared with, `None` for `should_run`
    pub compared_with: Option<DeviceId>,
    pub error: PredicateError,
}

impl PredicateFault {
    pub fn reason(&self) -> String {
        match &self.compared_with {
            Some(representative) => format!(
                "are_equivalent({}, {}): {}",
                representative, self.device, self.error
            ),
            None => format!("should_run({}): {}", self.device, self.error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceAssignment {
    /// Devices that must run the test, in input order
    pub representatives: Vec<Device>,
    /// Non-representatives with the representative they are covered by
    pub redundant: Vec<(DeviceId, DeviceId)>,
    /// Devices whose `should_run` returned false
    pub excluded: Vec<DeviceId>,
    pub faults: Vec<PredicateFault>,
}

impl DeviceAssignment {
    /// No device can run the test and no predicate error explains why
    pub fn is_skipped_no_device(&self) -> bool {
        self.representatives.is_empty()
            && !self.faults.iter().any(|fault| fault.compared_with.is_none())
    }

    pub fn representative_of(&self, device: &DeviceId) -> Option<&DeviceId> {
        if let Some(rep) = self.representatives.iter().find(|rep| &rep.id == device) {
            return Some(&rep.id);
        }
        self.redundant
            .iter()
            .find(|(redundant, _)| redundant == device)
            .map(|(_, rep)| rep)
    }
}

pub fn group_devices(candidates: &[Device], predicate: &ResolvedPredicate) -> DeviceAssignment {
    let mut assignment = DeviceAssignment::default();

    for device in candidates {
        match predicate.should_run(device) {
            Ok(true) => {}
            Ok(false) => {
                assignment.excluded.push(device.id.clone());
                continue;
            }
            Err(error) => {
                warn!(device = %device.id, predicate = predicate.label(), error = %error, "should_run failed");
                assignment.faults.push(PredicateFault {
                    device: device.id.clone(),
                    compared_with: None,
                    error,
                });
                continue;
            }
        }

        let mut covered_by = None;
        for representative in &assignment.representatives {
            match predicate.are_equivalent(representative, device) {
                Ok(true) => {
                    covered_by = Some(representative.id.clone());
                    break;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        device = %device.id,
                        representative = %representative.id,
                        predicate = predicate.label(),
                        error = %error,
                        "are_equivalent failed"
                    );
                    assignment.faults.push(PredicateFault {
                        device: device.id.clone(),
                        compared_with: Some(representative.id.clone()),
                        error,
                    });
                }
            }
        }

        match covered_by {
            Some(representative) => assignment.redundant.push((device.id.clone(), representative)),
            None => assignment.representatives.push(device.clone()),
        }
    }

    assignment
}

/// Outcomes decided by grouping alone: predicate errors, redundant devices
/// and the no-device skip. Reported before anything runs.
///
/// A failed `are_equivalent` comparison does not stop the device from
/// running on its own, so that (test, device) pair gets two reports: the
/// `SelectionPredicateError` from here and later its real outcome.
pub fn synthetic_outcomes(test: &TestCase, assignment: &DeviceAssignment) -> Vec<OutcomeReport> {
    let mut reports = Vec::new();

    for fault in &assignment.faults {
        reports.push(OutcomeReport::new(
            test.id.clone(),
            Some(fault.device.clone()),
            Outcome::SelectionPredicateError(fault.reason()),
        ));
    }

    for (device, representative) in &assignment.redundant {
        reports.push(OutcomeReport::new(
            test.id.clone(),
            Some(device.clone()),
            Outcome::SkippedRedundant(representative.clone()),
        ));
    }

    if assignment.is_skipped_no_device() {
        reports.push(OutcomeReport::new(test.id.clone(), None, Outcome::SkippedNoDevice));
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotest_common::predicate::{PredicateRegistry, SelectionPredicate};
    use nanotest_common::types::TestCaseId;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn ids(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(|d| d.id.as_str()).collect()
    }

    fn make_test() -> TestCase {
        TestCase {
            id: TestCaseId::new("Gpio", "Toggle", None),
            assembly: "Sample".to_string(),
            args: Vec::new(),
            predicate: SelectionPredicate::AnyDevice,
            description: "Gpio.Toggle".to_string(),
            traits: Default::default(),
        }
    }

    /// Equivalence given by an explicit list of equivalent pairs
    fn pairwise(pairs: &'static [(&'static str, &'static str)]) -> ResolvedPredicate {
        ResolvedPredicate::new(
            "pairwise",
            |_| Ok(true),
            move |a, b| {
                let (a, b) = (a.id.as_str(), b.id.as_str());
                Ok(pairs.iter().any(|&(x, y)| (x == a && y == b) || (x == b && y == a)))
            },
        )
    }

    #[test]
    fn test_redundant_device_is_covered_by_its_representative() {
        let devices = vec![Device::new("A"), Device::new("B"), Device::new("C")];

        let assignment = group_devices(&devices, &pairwise(&[("A", "B")]));

        assert_eq!(ids(&assignment.representatives), vec!["A", "C"]);
        assert_eq!(
            assignment.redundant,
            vec![(DeviceId::from("B"), DeviceId::from("A"))]
        );
        assert_eq!(assignment.representative_of(&DeviceId::from("B")), Some(&DeviceId::from("A")));
        assert!(assignment.faults.is_empty());
    }

    #[test]
    fn test_representative_of_every_kind_of_device() {
        let predicate = ResolvedPredicate::new(
            "pairs",
            |d| Ok(d.id.as_str() != "X"),
            |a, b| Ok(a.id.as_str() == "A" && b.id.as_str() == "B"),
        );
        let devices = vec![Device::new("A"), Device::new("B"), Device::new("C"), Device::new("X")];

        let assignment = group_devices(&devices, &predicate);
        // the lookup key is a temporary; the answer borrows only the assignment
        let of = |id: &str| assignment.representative_of(&DeviceId::from(id)).cloned();

        assert_eq!(of("A"), Some(DeviceId::from("A")));
        assert_eq!(of("B"), Some(DeviceId::from("A")));
        assert_eq!(of("C"), Some(DeviceId::from("C")));
        assert_eq!(of("X"), None);
        assert_eq!(of("unknown"), None);
    }

    #[test]
    fn test_non_transitive_equivalence_depends_on_order() {
        // A~B, B~C, but A!~C
        let predicate = pairwise(&[("A", "B"), ("B", "C")]);

        let forward = group_devices(&[Device::new("A"), Device::new("B"), Device::new("C")], &predicate);
        assert_eq!(ids(&forward.representatives), vec!["A", "C"]);

        let reordered = group_devices(&[Device::new("B"), Device::new("A"), Device::new("C")], &predicate);
        assert_eq!(ids(&reordered.representatives), vec!["B"]);
    }

    #[test]
    fn test_no_usable_device_is_skipped() {
        let registry = PredicateRegistry::new();
        let predicate = registry.resolve(&SelectionPredicate::RealHardware { all_devices: false });

        let assignment = group_devices(&[Device::new("virtual")], &predicate);
        let reports = synthetic_outcomes(&make_test(), &assignment);

        assert_eq!(assignment.excluded, vec![DeviceId::from("virtual")]);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::SkippedNoDevice);
        assert_eq!(reports[0].device, None);
    }

    #[test]
    fn test_should_run_error_excludes_only_that_device() {
        let predicate = ResolvedPredicate::new(
            "flaky",
            |d| {
                if d.id.as_str() == "B" {
                    Err("usb enumeration failed".into())
                } else {
                    Ok(true)
                }
            },
            |_, _| Ok(false),
        );

        let assignment = group_devices(&[Device::new("A"), Device::new("B")], &predicate);
        let reports = synthetic_outcomes(&make_test(), &assignment);

        assert_eq!(ids(&assignment.representatives), vec!["A"]);
        assert_eq!(reports.len(), 1);
        assert!(matches!(&reports[0].outcome, Outcome::SelectionPredicateError(reason) if reason.contains("usb enumeration failed")));
        assert_eq!(reports[0].device, Some(DeviceId::from("B")));
    }

    #[test]
    fn test_only_errors_do_not_report_skipped_no_device() {
        let predicate = ResolvedPredicate::new("broken", |_| Err("boom".into()), |_, _| Ok(true));

        let assignment = group_devices(&[Device::new("A"), Device::new("B")], &predicate);
        let reports = synthetic_outcomes(&make_test(), &assignment);

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| matches!(r.outcome, Outcome::SelectionPredicateError(_))));
    }

    #[test]
    fn test_failing_equivalence_excludes_neither_device() {
        let predicate = ResolvedPredicate::new("pair", |_| Ok(true), |_, _| panic!("comparison exploded"));

        let assignment = group_devices(&[Device::new("A"), Device::new("B")], &predicate);
        let reports = synthetic_outcomes(&make_test(), &assignment);

        assert_eq!(ids(&assignment.representatives), vec!["A", "B"]);
        assert_eq!(assignment.faults.len(), 1);
        assert_eq!(assignment.faults[0].compared_with, Some(DeviceId::from("A")));
        assert_eq!(reports.len(), 1);
        assert!(matches!(&reports[0].outcome, Outcome::SelectionPredicateError(reason) if reason.contains("are_equivalent(A, B)")));
        // B still runs, so its real outcome follows this one
        assert_eq!(reports[0].device, Some(DeviceId::from("B")));
        assert_eq!(assignment.representative_of(&DeviceId::from("B")), Some(&DeviceId::from("B")));
    }

    #[test]
    fn test_failed_comparison_continues_with_later_classes() {
        let predicate = ResolvedPredicate::new(
            "partial",
            |_| Ok(true),
            |rep, d| match (rep.id.as_str(), d.id.as_str()) {
                ("A", "C") => Err("timeout".into()),
                ("B", "C") => Ok(true),
                _ => Ok(false),
            },
        );

        let devices = vec![Device::new("A"), Device::new("B"), Device::new("C")];
        let assignment = group_devices(&devices, &predicate);

        assert_eq!(ids(&assignment.representatives), vec!["A", "B"]);
        assert_eq!(
            assignment.redundant,
            vec![(DeviceId::from("C"), DeviceId::from("B"))]
        );
        assert_eq!(assignment.faults.len(), 1);
    }

    #[test]
    fn test_empty_candidate_list() {
        let predicate = PredicateRegistry::new().resolve(&SelectionPredicate::AnyDevice);

        let assignment = group_devices(&[], &predicate);

        assert!(assignment.is_skipped_no_device());
    }

    fn keyed_devices(layout: &[(bool, u8)]) -> Vec<Device> {
        layout.iter()
            .enumerate()
            .map(|(i, (usable, key))| {
                Device::new(format!("d{}", i))
                    .with_value("usable", if *usable { "yes" } else { "no" })
                    .with_value("group", key.to_string())
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_every_device_is_accounted_for_once(layout in proptest::collection::vec((any::<bool>(), 0u8..4), 0..12)) {
            let registry = PredicateRegistry::new();
            let usable = registry.resolve(&SelectionPredicate::DeploymentValue {
                key: "usable".to_string(),
                value: Some("yes".to_string()),
            });
            let grouped_by = registry.resolve(&SelectionPredicate::DeploymentValue {
                key: "group".to_string(),
                value: None,
            });
            let predicate = ResolvedPredicate::new(
                "usable-by-group",
                move |d| Ok(usable.should_run(d)?),
                move |a, b| Ok(grouped_by.are_equivalent(a, b)?),
            );
            let devices = keyed_devices(&layout);

            let assignment = group_devices(&devices, &predicate);

            // one representative per equivalence class
            let groups: HashSet<_> = assignment
                .representatives
                .iter()
                .map(|d| d.deployment_value("group").map(str::to_string))
                .collect();
            prop_assert_eq!(groups.len(), assignment.representatives.len());

            for device in &devices {
                let is_rep = assignment.representatives.iter().any(|r| r.id == device.id);
                let redundant_with: Vec<_> = assignment
                    .redundant
                    .iter()
                    .filter(|(d, _)| d == &device.id)
                    .collect();
                let is_excluded = assignment.excluded.contains(&device.id);

                let roles = [is_rep, !redundant_with.is_empty(), is_excluded];
                prop_assert_eq!(roles.iter().filter(|r| **r).count(), 1);
                prop_assert!(redundant_with.len() <= 1);
                if let Some((_, rep)) = redundant_with.first() {
                    prop_assert!(assignment.representatives.iter().any(|r| &r.id == rep));
                }
            }
        }
    }
}

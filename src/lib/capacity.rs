//! Admission control: decides whether a VM fits the pool before anything is
//! created on the hypervisor.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::settings::{HostSelection, PlannerSettings};
use crate::snapshot::PoolSnapshot;
use crate::structs::{
    bytes_to_gib, Admission, HostCandidate, RepositoryKey, RepositoryVerdict, StorageRepositoryInfo,
    StorageRequest,
};

pub const INSUFFICIENT_MEMORY: &str = "insufficient cluster memory";
pub const INSUFFICIENT_STORAGE: &str = "insufficient storage";

/// Memory held back on a host so it never runs past the utilisation ceiling.
pub fn reserved_memory(host: &HostCandidate, max_host_utilisation_pct: f64) -> f64 {
    host.memory_total as f64 * (100.0 - max_host_utilisation_pct) / 100.0
}

/// A live host fits when the request plus hypervisor overhead still leaves
/// the reserved margin free.
pub fn host_fits(host: &HostCandidate, requested_memory: u64, settings: &PlannerSettings) -> bool {
    if !host.is_live {
        return false;
    }
    let effective = requested_memory as f64 * (100.0 + settings.vm_ram_overhead_pct) / 100.0;
    host.memory_free as f64 - effective
        >= reserved_memory(host, settings.host_max_ram_utilization_pct)
}

/// Picks a home server for a VM of `requested_memory` bytes.
pub fn select_host(
    hosts: &[HostCandidate],
    requested_memory: u64,
    settings: &PlannerSettings,
) -> Admission<HostCandidate> {
    info!(
        "Requested memory size is {:.2} GiB...",
        bytes_to_gib(requested_memory as f64)
    );
    let mut admissible: Vec<&HostCandidate> = vec![];
    for host in hosts {
        if !host.is_live {
            debug!("  {}: down, skipping", host.name);
            continue;
        }
        debug!(
            "  {}: {:.2} GiB total memory, {:.2} GiB free ({:.2} GiB reserved)",
            host.name,
            bytes_to_gib(host.memory_total as f64),
            bytes_to_gib(host.memory_free as f64),
            bytes_to_gib(reserved_memory(host, settings.host_max_ram_utilization_pct)),
        );
        if host_fits(host, requested_memory, settings) {
            admissible.push(host);
            if settings.host_selection == HostSelection::FirstFit {
                break;
            }
        }
    }

    let chosen = match settings.host_selection {
        HostSelection::FirstFit => admissible.first().copied(),
        HostSelection::MostFreeMemory => admissible.into_iter().min_by(|a, b| {
            b.memory_free
                .cmp(&a.memory_free)
                .then_with(|| a.name.cmp(&b.name))
        }),
    };
    match chosen {
        Some(host) => {
            info!(
                "  {} has enough free memory ({:.2} GiB), setting as home server",
                host.name,
                bytes_to_gib(host.memory_free as f64)
            );
            Admission::Admitted(host.clone())
        }
        None => {
            error!("  There is not any host server in pool with enough memory...");
            Admission::rejected(INSUFFICIENT_MEMORY)
        }
    }
}

/// Sums requested bytes per repository key.
pub fn group_requests(requests: &[StorageRequest]) -> BTreeMap<RepositoryKey, u64> {
    let mut totals: BTreeMap<RepositoryKey, u64> = BTreeMap::new();
    for req in requests {
        let total = totals.entry(req.repository.clone()).or_insert(0);
        *total = total.saturating_add(req.size_bytes);
    }
    totals
}

/// Projected utilisation of one repository after placing `size` bytes, of
/// which `allocation_pct` percent is counted.
pub fn repository_verdict(
    sr: &StorageRepositoryInfo,
    size: u64,
    allocation_pct: f64,
    max_utilisation_pct: f64,
) -> RepositoryVerdict {
    let counted = size as f64 * (allocation_pct / 100.0);
    let projected_utilisation = sr.physical_utilisation as f64 + counted;
    let projected_allocation = sr.virtual_allocation as f64 + counted;
    let utilisation_pct = if sr.physical_size == 0 {
        f64::INFINITY
    } else {
        projected_utilisation / sr.physical_size as f64 * 100.0
    };
    RepositoryVerdict {
        repository: sr.name.clone(),
        requested_bytes: size,
        projected_utilisation,
        projected_allocation,
        utilisation_pct,
        admitted: utilisation_pct <= max_utilisation_pct,
    }
}

/// Checks every repository touched by `requests`. One unknown repository
/// rejects the batch immediately; otherwise every repository is evaluated
/// and all of them must pass.
pub fn check_storage(
    snapshot: &PoolSnapshot,
    requests: &[StorageRequest],
    allocation_pct: f64,
    settings: &PlannerSettings,
) -> Admission<Vec<RepositoryVerdict>> {
    let limit = settings.max_storage_allocated_pct;
    let mut verdicts = vec![];
    let grouped = group_requests(requests);
    if let Some(default) = snapshot.repository(&RepositoryKey::Default) {
        if grouped.contains_key(&RepositoryKey::Named(default.name.clone())) {
            warn!(
                "  Default SR {} is also requested by name; both groups are checked separately",
                default.name
            );
        }
    }
    for (key, size) in grouped {
        let sr = match snapshot.repository(&key) {
            Some(sr) => sr,
            None => {
                error!("  Storage Repository {key} not available");
                return Admission::rejected(format!("repository not found: {key}"));
            }
        };
        debug!(
            "  Requested allocation on {} is {:.2} GiB (calculating with {:.2}% utilisation of requested disk space)",
            sr.name,
            bytes_to_gib(size as f64),
            allocation_pct
        );
        let verdict = repository_verdict(sr, size, allocation_pct, limit);
        if !verdict.admitted {
            let overallocation = if sr.physical_size == 0 {
                f64::INFINITY
            } else {
                verdict.projected_allocation / sr.physical_size as f64
            };
            error!(
                "  {} ({:.0} GiB of {:.0} GiB allocated; {:.0} GiB utilised ({:.2}%); overallocation factor is {:.2}x)",
                sr.name,
                bytes_to_gib(verdict.projected_allocation),
                bytes_to_gib(sr.physical_size as f64),
                bytes_to_gib(verdict.projected_utilisation),
                verdict.utilisation_pct,
                overallocation
            );
            error!("  Cannot proceed with storage utilized more than {limit:.2}%...");
        }
        verdicts.push(verdict);
    }

    let failed: Vec<&str> = verdicts
        .iter()
        .filter(|v| !v.admitted)
        .map(|v| v.repository.as_str())
        .collect();
    if failed.is_empty() {
        Admission::Admitted(verdicts)
    } else {
        Admission::rejected(format!("{INSUFFICIENT_STORAGE} on {}", failed.join(", ")))
    }
}

/// Host plus storage decisions for one VM request.
#[derive(Debug, Clone)]
pub struct Placement {
    pub host: HostCandidate,
    pub template_storage: Vec<RepositoryVerdict>,
    pub extra_storage: Vec<RepositoryVerdict>,
}

/// Runs memory, template-storage and extra-VDI storage admission in that
/// order against one snapshot. The first rejection is fatal.
pub fn plan(
    snapshot: &PoolSnapshot,
    requested_memory: u64,
    template_disks: &[StorageRequest],
    extra_vdis: &[StorageRequest],
    settings: &PlannerSettings,
) -> Result<Placement> {
    let host = select_host(&snapshot.hosts, requested_memory, settings)
        .into_result()
        .map_err(|e| anyhow::anyhow!("Not enough free RAM on any of XEN Hosts: {e}"))?;

    info!("Checking disk space for template...");
    let template_storage = check_storage(
        snapshot,
        template_disks,
        settings.template_allocation_pct,
        settings,
    )
    .into_result()
    .map_err(|e| anyhow::anyhow!("Not enough disk free space available: {e}"))?;

    let extra_storage = if extra_vdis.is_empty() {
        vec![]
    } else {
        info!("Checking disk space for extra VDIs...");
        check_storage(
            snapshot,
            extra_vdis,
            settings.additional_allocation_pct,
            settings,
        )
        .into_result()
        .map_err(|e| anyhow::anyhow!("Not enough disk free space available for extra VDIs: {e}"))?
    };

    Ok(Placement {
        host,
        template_storage,
        extra_storage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::GIB;
    use rstest::rstest;

    fn host(name: &str, live: bool, total_gib: u64, free_gib: u64) -> HostCandidate {
        HostCandidate {
            name: name.to_string(),
            is_live: live,
            memory_total: total_gib * GIB,
            memory_free: free_gib * GIB,
        }
    }

    fn sr(name: &str, size_gib: u64, used_gib: u64) -> StorageRepositoryInfo {
        StorageRepositoryInfo {
            name: name.to_string(),
            physical_size: size_gib * GIB,
            physical_utilisation: used_gib * GIB,
            virtual_allocation: used_gib * GIB,
        }
    }

    fn snapshot(repositories: Vec<StorageRepositoryInfo>, default: Option<&str>) -> PoolSnapshot {
        PoolSnapshot {
            hosts: vec![],
            repositories,
            default_repository: default.map(String::from),
        }
    }

    #[test]
    fn admits_host_with_headroom() {
        // reserved 1.6 GiB, effective request 5 GiB, 15 GiB left
        let settings = PlannerSettings::default();
        let hosts = vec![host("xen01", true, 32, 20)];
        match select_host(&hosts, 4 * GIB, &settings) {
            Admission::Admitted(h) => assert_eq!(h.name, "xen01"),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[rstest]
    // exactly at the margin: 7 - 5 = 2 reserved of 40
    #[case(40 * GIB, 7 * GIB, true)]
    #[case(40 * GIB, 7 * GIB - 1, false)]
    #[case(32 * GIB, 5 * GIB, false)]
    fn margin_is_inclusive(#[case] total: u64, #[case] free: u64, #[case] fits: bool) {
        let h = HostCandidate {
            name: "h".into(),
            is_live: true,
            memory_total: total,
            memory_free: free,
        };
        assert_eq!(host_fits(&h, 4 * GIB, &PlannerSettings::default()), fits);
    }

    #[test]
    fn skips_dead_hosts() {
        let settings = PlannerSettings::default();
        let hosts = vec![host("dead", false, 64, 64), host("alive", true, 32, 20)];
        match select_host(&hosts, 4 * GIB, &settings) {
            Admission::Admitted(h) => assert_eq!(h.name, "alive"),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn rejects_when_no_host_fits() {
        let settings = PlannerSettings::default();
        let hosts = vec![host("a", true, 32, 4), host("b", false, 64, 60)];
        assert_eq!(
            select_host(&hosts, 4 * GIB, &settings),
            Admission::rejected(INSUFFICIENT_MEMORY)
        );
        assert!(!select_host(&[], GIB, &settings).is_admitted());
    }

    #[test]
    fn every_admitted_host_satisfies_predicate() {
        let settings = PlannerSettings::default();
        let hosts = vec![
            host("a", true, 16, 2),
            host("b", true, 32, 12),
            host("c", true, 64, 40),
        ];
        for (i, _) in hosts.iter().enumerate() {
            let mut rotated = hosts.clone();
            rotated.rotate_left(i);
            if let Admission::Admitted(h) = select_host(&rotated, 8 * GIB, &settings) {
                assert!(host_fits(&h, 8 * GIB, &settings));
            } else {
                panic!("some host fits");
            }
        }
    }

    #[test]
    fn most_free_memory_strategy() {
        let settings = PlannerSettings {
            host_selection: HostSelection::MostFreeMemory,
            ..Default::default()
        };
        let hosts = vec![
            host("small", true, 32, 12),
            host("big", true, 64, 40),
            host("down", false, 128, 120),
        ];
        match select_host(&hosts, 4 * GIB, &settings) {
            Admission::Admitted(h) => assert_eq!(h.name, "big"),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn same_snapshot_same_decision() {
        let settings = PlannerSettings::default();
        let hosts = vec![host("a", true, 32, 4), host("b", true, 32, 20)];
        let first = select_host(&hosts, 2 * GIB, &settings);
        let second = select_host(&hosts, 2 * GIB, &settings);
        assert_eq!(first, second);
    }

    #[test]
    fn storage_rejects_past_ceiling() {
        // 70 + 20 of 100 GiB is 90%, over the 80% default
        let snap = snapshot(vec![sr("Local storage", 100, 70)], None);
        let reqs = vec![StorageRequest::new(Some("Local storage"), 20 * GIB)];
        let res = check_storage(&snap, &reqs, 100.0, &PlannerSettings::default());
        assert!(!res.is_admitted());
    }

    #[test]
    fn storage_counts_allocation_pct() {
        // only a quarter of the 20 GiB counts
        let snap = snapshot(vec![sr("Local storage", 100, 70)], None);
        let reqs = vec![StorageRequest::new(Some("Local storage"), 20 * GIB)];
        match check_storage(&snap, &reqs, 25.0, &PlannerSettings::default()) {
            Admission::Admitted(verdicts) => {
                assert_eq!(verdicts.len(), 1);
                assert!((verdicts[0].utilisation_pct - 75.0).abs() < 1e-9);
            }
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[rstest]
    // 60 + 20 of 100 GiB lands exactly on the 80% ceiling
    #[case(20 * GIB, true)]
    #[case(20 * GIB + 1, false)]
    fn storage_ceiling_is_inclusive(#[case] size: u64, #[case] admitted: bool) {
        let verdict = repository_verdict(&sr("Local storage", 100, 60), size, 100.0, 80.0);
        assert_eq!(verdict.admitted, admitted, "{verdict:?}");
    }

    #[test]
    fn same_snapshot_same_storage_decision() {
        let snap = snapshot(vec![sr("a", 100, 50), sr("b", 100, 78)], Some("a"));
        let reqs = vec![
            StorageRequest::new(None, 10 * GIB),
            StorageRequest::new(Some("b"), 5 * GIB),
        ];
        let settings = PlannerSettings::default();
        let first = check_storage(&snap, &reqs, 100.0, &settings);
        let second = check_storage(&snap, &reqs, 100.0, &settings);
        assert_eq!(first, second);
        assert!(!first.is_admitted());
    }

    #[test]
    fn default_and_named_groups_of_one_sr_are_checked_apart() {
        // each group alone is 77%; together they would be 82%
        let snap = snapshot(vec![sr("Local storage", 100, 72)], Some("Local storage"));
        let reqs = vec![
            StorageRequest::new(None, 5 * GIB),
            StorageRequest::new(Some("Local storage"), 5 * GIB),
        ];
        match check_storage(&snap, &reqs, 100.0, &PlannerSettings::default()) {
            Admission::Admitted(verdicts) => {
                assert_eq!(verdicts.len(), 2);
                assert!(verdicts.iter().all(|v| v.repository == "Local storage"));
            }
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn storage_sums_per_repository_before_checking() {
        // 10 + 10 on one SR pushes 65 GiB to 85%
        let snap = snapshot(vec![sr("nfs", 100, 65)], None);
        let single = vec![StorageRequest::new(Some("nfs"), 10 * GIB)];
        let double = vec![
            StorageRequest::new(Some("nfs"), 10 * GIB),
            StorageRequest::new(Some("nfs"), 10 * GIB),
        ];
        let settings = PlannerSettings::default();
        assert!(check_storage(&snap, &single, 100.0, &settings).is_admitted());
        assert!(!check_storage(&snap, &double, 100.0, &settings).is_admitted());
    }

    #[test]
    fn one_failing_repository_rejects_batch_but_all_are_evaluated() {
        let snap = snapshot(
            vec![sr("a", 100, 79), sr("b", 100, 79), sr("c", 100, 0)],
            Some("a"),
        );
        let reqs = vec![
            StorageRequest::new(None, 5 * GIB),
            StorageRequest::new(Some("b"), 5 * GIB),
            StorageRequest::new(Some("c"), GIB),
        ];
        match check_storage(&snap, &reqs, 100.0, &PlannerSettings::default()) {
            Admission::Rejected { reason } => {
                assert_eq!(reason, format!("{INSUFFICIENT_STORAGE} on a, b"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[rstest]
    #[case(Some("missing"), Some("a"))]
    #[case(None, None)]
    fn unresolved_repository_is_rejected(
        #[case] repository: Option<&str>,
        #[case] default: Option<&str>,
    ) {
        let snap = snapshot(vec![sr("a", 100, 0)], default);
        let reqs = vec![
            StorageRequest::new(Some("a"), GIB),
            StorageRequest::new(repository, GIB),
        ];
        match check_storage(&snap, &reqs, 100.0, &PlannerSettings::default()) {
            Admission::Rejected { reason } => assert!(reason.starts_with("repository not found")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn empty_request_set_is_admitted() {
        let snap = snapshot(vec![], None);
        assert_eq!(
            check_storage(&snap, &[], 100.0, &PlannerSettings::default()),
            Admission::Admitted(vec![])
        );
    }

    #[test]
    fn plan_stops_at_first_rejection() {
        let snap = PoolSnapshot {
            hosts: vec![host("xen01", true, 32, 20)],
            repositories: vec![sr("local", 100, 10), sr("full", 100, 79)],
            default_repository: Some("local".into()),
        };
        let settings = PlannerSettings::default();
        let template = vec![StorageRequest::new(Some("local"), 8 * GIB)];

        let placement = plan(&snap, 4 * GIB, &template, &[], &settings).unwrap();
        assert_eq!(placement.host.name, "xen01");
        assert_eq!(placement.template_storage.len(), 1);
        assert!(placement.extra_storage.is_empty());

        let extra = vec![StorageRequest::new(Some("full"), 5 * GIB)];
        let err = plan(&snap, 4 * GIB, &template, &extra, &settings).unwrap_err();
        assert!(err.to_string().contains("extra VDIs"));

        let err = plan(&snap, 64 * GIB, &template, &[], &settings).unwrap_err();
        assert!(err.to_string().contains(INSUFFICIENT_MEMORY));
    }
}

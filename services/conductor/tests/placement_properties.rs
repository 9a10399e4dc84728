//! Placement never returns a host the request excludes.

use std::collections::BTreeMap;
use std::sync::Arc;

use cirrus_conductor::config::SchedulerConfig;
use cirrus_conductor::db::MemoryStore;
use cirrus_conductor::model::{
    FilterProperties, Flavor, Instance, PowerState, RequestSpec, RetryContext, TriedHost, VmState,
};
use cirrus_conductor::scheduler::{HostSelector, HostState, InventoryScheduler};
use cirrus_id::InstanceId;
use proptest::prelude::*;

const HOSTS: [&str; 6] = ["h0", "h1", "h2", "h3", "h4", "h5"];

fn flavor() -> Flavor {
    Flavor {
        id: 1,
        flavorid: "1".to_string(),
        name: "m1.small".to_string(),
        memory_mb: 512,
        vcpus: 1,
        root_gb: 1,
        ephemeral_gb: 0,
        extra_specs: BTreeMap::new(),
    }
}

fn instance() -> Instance {
    Instance {
        uuid: InstanceId::new(),
        vm_state: Some(VmState::Active),
        task_state: None,
        power_state: PowerState::Running,
        host: None,
        node: None,
        flavor: flavor(),
        image_ref: None,
        project_id: None,
        system_metadata: BTreeMap::new(),
    }
}

proptest! {
    #[test]
    fn prop_excluded_hosts_are_never_selected(
        ignored in proptest::sample::subsequence(HOSTS.to_vec(), 0..=HOSTS.len()),
        tried in proptest::sample::subsequence(HOSTS.to_vec(), 0..=HOSTS.len()),
        num_instances in 1usize..=4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let scheduler = Arc::new(InventoryScheduler::new(
            HOSTS.iter().map(|h| HostState::new(*h, 4096, 8, 100)),
        ));
        let selector = HostSelector::new(
            scheduler,
            Arc::new(MemoryStore::new()),
            SchedulerConfig::default(),
        );

        let instances: Vec<_> = (0..num_instances).map(|_| instance()).collect();
        let spec = RequestSpec::build(None, &instances, None).unwrap();
        let mut filter = FilterProperties::ignoring(ignored.iter().copied());
        filter.retry = Some(RetryContext {
            instance_uuid: instances[0].uuid,
            num_attempts: 1,
            hosts: tried
                .iter()
                .map(|h| TriedHost { host: h.to_string(), node: h.to_string() })
                .collect(),
        });
        let excluded = filter.excluded_hosts();

        let result = runtime.block_on(selector.select_destinations(&spec, &filter));

        match result {
            Ok(candidates) => {
                prop_assert_eq!(candidates.len(), num_instances);
                for candidate in &candidates {
                    prop_assert!(!excluded.contains(&candidate.host));
                }
            }
            Err(err) => {
                // 6 hosts x 8 slots: only running out of eligible hosts fails.
                prop_assert_eq!(excluded.len(), HOSTS.len());
                prop_assert!(matches!(
                    err,
                    cirrus_conductor::error::ConductorError::NoValidHost { .. }
                ), "expected NoValidHost, got {:?}", err);
            }
        }
    }
}

//! Property-based tests for the allocation engine.
//!
//! These verify the table invariants over arbitrary allocate/release
//! interleavings, complementing the scenario-driven unit tests.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use super::{AllocateRequest, AllocationEngine};
use crate::probe::MockProbe;
use crate::registry::{base_document, ServiceRegistry, UserConfig};

fn engine() -> AllocationEngine {
    let registry = Arc::new(ServiceRegistry::from_documents(
        base_document().unwrap(),
        UserConfig::default(),
    ));
    AllocationEngine::new(registry, Arc::new(MockProbe::new()))
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { service_type: &'static str },
    ReleaseNth(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop_oneof![
            Just("dev"),
            Just("api"),
            Just("storybook"),
            Just("ai"),
            Just("test"),
        ]
        .prop_map(|service_type| Op::Allocate { service_type }),
        1 => (0usize..32).prop_map(Op::ReleaseNth),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    // Uniqueness: no two grants ever share a port or a lock id, whatever
    // the interleaving of allocates and releases.
    #[test]
    fn grant_table_stays_unique(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let engine = engine();
        let mut live_locks: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { service_type } => {
                    if let Ok(outcome) = engine.allocate(AllocateRequest::for_type(service_type)) {
                        if let Some(lock_id) = outcome.lock_id {
                            if !outcome.existing {
                                live_locks.push(lock_id.to_string());
                            }
                        }
                    }
                }
                Op::ReleaseNth(n) => {
                    if !live_locks.is_empty() {
                        let lock = live_locks.remove(n % live_locks.len());
                        prop_assert!(engine.release(&lock).is_ok());
                    }
                }
            }

            let grants = engine.grants();
            let ports: HashSet<u16> = grants.iter().map(|g| g.port.value()).collect();
            prop_assert_eq!(ports.len(), grants.len());
            let locks: HashSet<String> =
                grants.iter().map(|g| g.lock_id.to_string()).collect();
            prop_assert_eq!(locks.len(), grants.len());
        }
    }

    // Singleton: at most one 'ai' grant at any instant, and exactly one
    // matching claim whenever one exists.
    #[test]
    fn singleton_invariant_holds(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let engine = engine();
        let mut live_locks: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { service_type } => {
                    if let Ok(outcome) = engine.allocate(AllocateRequest::for_type(service_type)) {
                        if let (Some(lock_id), false) = (outcome.lock_id, outcome.existing) {
                            live_locks.push(lock_id.to_string());
                        }
                    }
                }
                Op::ReleaseNth(n) => {
                    if !live_locks.is_empty() {
                        let lock = live_locks.remove(n % live_locks.len());
                        let _ = engine.release(&lock);
                    }
                }
            }

            let ai_grants: Vec<_> = engine
                .grants()
                .into_iter()
                .filter(|g| g.service_type == "ai")
                .collect();
            prop_assert!(ai_grants.len() <= 1);

            let claims = engine.singletons();
            match ai_grants.first() {
                Some(grant) => {
                    let claim = claims
                        .iter()
                        .find(|c| c.service_type == "ai")
                        .expect("grant without claim");
                    prop_assert_eq!(claim.port, grant.port);
                    prop_assert_eq!(claim.lock_id, grant.lock_id);
                }
                None => prop_assert!(claims.iter().all(|c| c.service_type != "ai")),
            }
        }
    }

    // Range membership: every committed grant lies inside its service
    // type's range when no explicit preferred port was supplied.
    #[test]
    fn grants_live_in_their_ranges(count in 1usize..40) {
        let engine = engine();
        let registry = ServiceRegistry::from_documents(
            base_document().unwrap(),
            UserConfig::default(),
        );

        for _ in 0..count {
            let _ = engine.allocate(AllocateRequest::for_type("dev"));
            let _ = engine.allocate(AllocateRequest::for_type("api"));
        }

        for grant in engine.grants() {
            let service = registry.resolve(&grant.service_type).unwrap();
            prop_assert!(service.range.contains(grant.port));
        }
    }

    // Release inverse: releasing everything returns both tables to empty.
    #[test]
    fn release_is_the_inverse_of_allocate(count in 1usize..30) {
        let engine = engine();
        let mut locks = Vec::new();

        for i in 0..count {
            let service_type = ["dev", "api", "ai"][i % 3];
            if let Ok(outcome) = engine.allocate(AllocateRequest::for_type(service_type)) {
                if let (Some(lock), false) = (outcome.lock_id, outcome.existing) {
                    locks.push(lock.to_string());
                }
            }
        }

        for lock in locks {
            prop_assert!(engine.release(&lock).is_ok());
        }
        prop_assert_eq!(engine.grant_count(), 0);
        prop_assert_eq!(engine.singletons().len(), 0);
    }
}

//! Property test for the generation invariant: every successful
//! mutation strictly increases the global generation counter.

use std::collections::HashSet;

use common::EntityId;
use graph::model::ProviderRole;
use graph::store::MemoryGraphStore;
use proptest::prelude::*;

proptest! {
    #[test]
    fn every_successful_mutation_strictly_increases_global_generation(ops in prop::collection::vec(any::<bool>(), 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let store = MemoryGraphStore::new();
            let mut ids: Vec<EntityId> = Vec::new();
            let mut prev = store.global_generation().await;

            for create_new in ops {
                if create_new || ids.is_empty() {
                    let id = EntityId::new_v4();
                    let name = id.to_string();
                    store
                        .run_transaction(|w| w.create_provider(id, name, None, HashSet::from([ProviderRole::ComputeHost])))
                        .await
                        .unwrap();
                    ids.push(id);
                } else {
                    let id = ids[0];
                    let disabled = store.read(|s| s.provider(id).map(|p| p.disabled).unwrap_or(false)).await;
                    store.run_transaction(|w| w.set_disabled(id, !disabled)).await.unwrap();
                }

                let next = store.global_generation().await;
                prop_assert!(next > prev);
                prev = next;
            }

            Ok(())
        })?;
    }
}

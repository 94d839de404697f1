//! The cache warmer seeds strategies for synthetic repository shapes. A
//! synthetic store must never collide with a tenant's cached strategy even
//! when they share the exact same signature.

mod helpers;

use helpers::{build_test_env, FakeFetcher, FakeModelClient};
use rubricforge_core::compute_signature;
use rubricforge_server::types::{StrategyPerformance, StrategySource};
use std::collections::HashMap;

#[tokio::test]
async fn synthetic_and_tenant_strategies_never_collide() {
    let fetcher = FakeFetcher { listing: vec![], contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], vec![]);
    let env = build_test_env(fetcher, model);

    let files = vec!["README.md".to_string(), "src/pipeline/orchestrate.py".to_string()];
    let signature = compute_signature("mlops", &files, &files, 20_000).unwrap();

    let tenant_id = env
        .cache
        .store(&signature, "mlops", files.clone(), StrategyPerformance::default(), StrategySource::Tenant)
        .await
        .unwrap();
    let synthetic_id = env
        .cache
        .store(&signature, "mlops", files.clone(), StrategyPerformance::default(), StrategySource::Synthetic)
        .await
        .unwrap();

    assert_ne!(tenant_id, synthetic_id);

    let (size, _, _) = env.cache.stats().await.unwrap();
    assert_eq!(size, 2, "identical signatures from different provenances occupy separate cache rows");
}

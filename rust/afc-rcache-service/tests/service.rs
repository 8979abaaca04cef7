// afc-rcache-service: Background activity tests
//
// Run the real service loops over the in-memory cache store, with
// wiremock standing in for the ingress and the config service.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use afc_rcache::models::{
    LatLonRect, RcacheInvalidateReq, RcacheSpatialInvalidateReq, RcacheUpdateReq, ReqRespKey,
    RespState,
};
use afc_rcache::store::CacheStore;
use afc_rcache::testing::{sample_record, MemCacheStore};
use afc_rcache_service::metrics::ServiceMetrics;
use afc_rcache_service::{RcacheService, ServiceConfig};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const US_RULESET: &str = "US_47_CFR_PART_15_SUBPART_E";
const CA_RULESET: &str = "CA_RES_DBS-06";

fn make_service(
    store: Arc<MemCacheStore>,
    quota: usize,
    afc_req_url: Option<String>,
) -> Arc<RcacheService> {
    let service = RcacheService::new(
        store,
        ServiceConfig {
            precompute_quota: quota,
            afc_req_url,
            rulesets_url: None,
            config_retrieval_url: None,
        },
        Arc::new(ServiceMetrics::new()),
    );
    service.mark_db_connected();
    service
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    while !condition().await {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn invalid_record(digest: &str, ruleset: &str, lat: f64, lon: f64) -> afc_rcache::ApRecord {
    let mut record = sample_record(digest, ruleset, lat, lon);
    record.state = RespState::Invalid;
    record
}

#[tokio::test]
async fn test_spatial_invalidation_dilates_by_link_distance() {
    let store = Arc::new(MemCacheStore::new());
    // Inside the tile, near the tile (within 200 km), far away
    store.insert(sample_record("d-in", US_RULESET, 37.0, -122.0));
    store.insert(sample_record("d-near", US_RULESET, 38.5, -122.0));
    store.insert(sample_record("d-far", US_RULESET, 40.0, -100.0));
    let service = make_service(store.clone(), 0, None);
    let _workers = service.spawn_workers();

    service.enqueue_spatial_invalidation(RcacheSpatialInvalidateReq {
        tiles: vec![LatLonRect {
            min_lat: 36.0,
            max_lat: 38.0,
            min_lon: -123.0,
            max_lon: -121.0,
        }],
    });

    wait_until("spatial invalidation", || {
        let store = store.clone();
        async move { store.num_invalid().await.unwrap() == 2 }
    })
    .await;
    assert_eq!(store.state_of("d-in"), Some(RespState::Invalid));
    assert_eq!(store.state_of("d-near"), Some(RespState::Invalid));
    assert_eq!(store.state_of("d-far"), Some(RespState::Valid));
}

#[tokio::test]
async fn test_ruleset_invalidation_leaves_other_rulesets() {
    let store = Arc::new(MemCacheStore::new());
    store.insert(sample_record("d-us", US_RULESET, 37.0, -122.0));
    store.insert(sample_record("d-ca", CA_RULESET, 45.0, -75.0));
    let service = make_service(store.clone(), 0, None);
    let _workers = service.spawn_workers();

    service.enqueue_invalidation(RcacheInvalidateReq {
        ruleset_ids: Some(vec![US_RULESET.to_string()]),
    });

    wait_until("ruleset invalidation", || {
        let store = store.clone();
        async move { store.num_invalid().await.unwrap() == 1 }
    })
    .await;
    assert_eq!(store.state_of("d-us"), Some(RespState::Invalid));
    assert_eq!(store.state_of("d-ca"), Some(RespState::Valid));
}

#[tokio::test]
async fn test_complete_invalidation() {
    let store = Arc::new(MemCacheStore::new());
    store.insert(sample_record("d-us", US_RULESET, 37.0, -122.0));
    store.insert(sample_record("d-ca", CA_RULESET, 45.0, -75.0));
    let service = make_service(store.clone(), 0, None);
    let _workers = service.spawn_workers();

    service.enqueue_invalidation(RcacheInvalidateReq { ruleset_ids: None });

    wait_until("complete invalidation", || {
        let store = store.clone();
        async move { store.num_invalid().await.unwrap() == 2 }
    })
    .await;
}

#[tokio::test]
async fn test_invalidation_waits_for_switch() {
    let store = Arc::new(MemCacheStore::new());
    store.insert(sample_record("d-us", US_RULESET, 37.0, -122.0));
    store
        .set_switch(afc_rcache::FuncSwitch::Invalidate, false)
        .await
        .unwrap();
    let service = make_service(store.clone(), 0, None);
    let _workers = service.spawn_workers();

    service.enqueue_invalidation(RcacheInvalidateReq { ruleset_ids: None });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.num_invalid().await.unwrap(), 0);

    service.set_invalidation_enabled(true).await.unwrap();
    wait_until("invalidation after enabling", || {
        let store = store.clone();
        async move { store.num_invalid().await.unwrap() == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_updater_writes_rows_and_honors_switch() {
    let store = Arc::new(MemCacheStore::new());
    let service = make_service(store.clone(), 0, None);
    let _workers = service.spawn_workers();

    let template = sample_record("d1", US_RULESET, 37.0, -122.0);
    service.enqueue_update(RcacheUpdateReq {
        req_resp_keys: vec![ReqRespKey {
            req_cfg_digest: "d1".to_string(),
            afc_req: Some(template.request.clone()),
            afc_resp: Some(template.response.clone()),
        }],
    });
    wait_until("cache update", || {
        let store = store.clone();
        async move { store.cache_size().await.unwrap() == 1 }
    })
    .await;
    assert_eq!(store.state_of("d1"), Some(RespState::Valid));

    // With the Update switch off the batch is dropped
    service.set_update_enabled(false).await.unwrap();
    service.enqueue_update(RcacheUpdateReq {
        req_resp_keys: vec![ReqRespKey {
            req_cfg_digest: "d2".to_string(),
            afc_req: Some(
                sample_record("d2", US_RULESET, 38.0, -121.0).request.clone(),
            ),
            afc_resp: Some(
                sample_record("d2", US_RULESET, 38.0, -121.0).response.clone(),
            ),
        }],
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.cache_size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_precompute_quota_bounds_subtasks() {
    let ingress = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/availableSpectrumInquiry"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ingress)
        .await;

    let store = Arc::new(MemCacheStore::new());
    for digest in ["d1", "d2", "d3"] {
        store.insert(invalid_record(digest, US_RULESET, 37.0, -122.0));
    }
    let service = make_service(
        store.clone(),
        2,
        Some(format!("{}/availableSpectrumInquiry", ingress.uri())),
    );
    let _workers = service.spawn_workers();

    wait_until("precomputation claims", || {
        let store = store.clone();
        async move { store.num_precomputing().await.unwrap() == 2 }
    })
    .await;
    // Quota exhausted: the third row stays Invalid, no further POSTs
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.num_precomputing().await.unwrap(), 2);
    assert_eq!(store.num_invalid().await.unwrap(), 1);
    assert_eq!(ingress.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejected_precompute_drops_row() {
    let ingress = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&ingress)
        .await;

    let store = Arc::new(MemCacheStore::new());
    store.insert(invalid_record("d1", US_RULESET, 37.0, -122.0));
    let service = make_service(store.clone(), 5, Some(ingress.uri()));
    let _workers = service.spawn_workers();

    wait_until("row dropped", || {
        let store = store.clone();
        async move { store.cache_size().await.unwrap() == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_startup_resets_precomputing_rows() {
    let store = Arc::new(MemCacheStore::new());
    for digest in ["d1", "d2"] {
        let mut record = sample_record(digest, US_RULESET, 37.0, -122.0);
        record.state = RespState::Precomputing;
        store.insert(record);
    }
    // Quota 0: recovery happens, nothing gets re-claimed
    let service = make_service(store.clone(), 0, Some("http://localhost:1".to_string()));
    let _workers = service.spawn_workers();

    wait_until("crash recovery", || {
        let store = store.clone();
        async move { store.num_precomputing().await.unwrap() == 0 }
    })
    .await;
    assert_eq!(store.num_invalid().await.unwrap(), 2);
}

#[tokio::test]
async fn test_status_document() {
    let store = Arc::new(MemCacheStore::new());
    store.insert(sample_record("d1", US_RULESET, 37.0, -122.0));
    store.insert(invalid_record("d2", US_RULESET, 38.0, -121.0));
    let service = make_service(store, 7, None);

    let status = service.status().await;
    assert!(status.db_connected);
    assert!(status.all_tasks_running);
    assert_eq!(status.precomputation_quota, 7);
    assert_eq!(status.num_valid_entries, 1);
    assert_eq!(status.num_invalid_entries, 1);
    assert!(status.invalidation_enabled);
    assert!(status.update_enabled);
}

#[tokio::test]
async fn test_max_link_distance_from_config_service() {
    let config_service = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rulesetIds"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"rulesetId": [US_RULESET, CA_RULESET]})),
        )
        .mount(&config_service)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/afcConfig/{US_RULESET}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"maxLinkDistance": 130.0})),
        )
        .mount(&config_service)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/afcConfig/{CA_RULESET}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"maxLinkDistance": 30.0})),
        )
        .mount(&config_service)
        .await;

    let store = Arc::new(MemCacheStore::new());
    // A row ~1 degree (~111 km) north of the tile: inside a 130 km
    // clearance, outside a 30 km one
    store.insert(sample_record("d-near", US_RULESET, 39.0, -122.0));
    let service = RcacheService::new(
        store.clone(),
        ServiceConfig {
            precompute_quota: 0,
            afc_req_url: None,
            rulesets_url: Some(format!("{}/rulesetIds", config_service.uri())),
            config_retrieval_url: Some(format!("{}/afcConfig", config_service.uri())),
        },
        Arc::new(ServiceMetrics::new()),
    );
    service.mark_db_connected();
    let _workers = service.spawn_workers();

    service.enqueue_spatial_invalidation(RcacheSpatialInvalidateReq {
        tiles: vec![LatLonRect {
            min_lat: 36.0,
            max_lat: 38.0,
            min_lon: -123.0,
            max_lon: -121.0,
        }],
    });
    wait_until("dilated spatial invalidation", || {
        let store = store.clone();
        async move { store.num_invalid().await.unwrap() == 1 }
    })
    .await;
    assert_eq!(store.state_of("d-near"), Some(RespState::Invalid));
}

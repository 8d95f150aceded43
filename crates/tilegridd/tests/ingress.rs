//! Ingress regression tests: drive the router in-process with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use tilegrid_scheduler::ConnectorCache;
use tilegrid_state::*;
use tilegrid_worker::WorkerPool;
use tilegridd::ingress::{IngressState, build_router};

fn tile(path: &str, z: i64, status: TileStatus) -> Tile {
    Tile {
        relative_path: path.to_string(),
        tile_name: path.to_string(),
        position: Lattice::new(0, 0, z),
        step: Lattice::default(),
        this_stage_status: status,
        prev_stage_status: Some(TileStatus::Complete),
        created_at: 0,
        updated_at: 0,
    }
}

fn worker() -> WorkerInfo {
    WorkerInfo {
        id: "w1".to_string(),
        address: "127.0.0.1".to_string(),
        port: 6201,
        local_work_capacity: 4.0,
        cluster_work_capacity: 0.0,
        is_in_scheduler_pool: true,
        is_cluster_proxy: false,
        updated_at: 0,
    }
}

/// Store with project p1, stage s1 holding tiles a (Processing, running
/// execution e1), b (Incomplete, z=1) and c (Failed).
async fn test_state() -> IngressState {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_project(&Project {
            id: "p1".to_string(),
            name: "p1".to_string(),
            root_path: "/data".to_string(),
            region: RegionBounds::default(),
            skip_planes: Vec::new(),
            is_processing: false,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
    store
        .put_stage(&PipelineStage {
            id: "s1".to_string(),
            project_id: "p1".to_string(),
            name: "s1".to_string(),
            task_id: "t1".to_string(),
            function_type: StageFunction::MapTile,
            previous_stage_id: None,
            depth: 1,
            dst_path: "/out".to_string(),
            is_processing: false,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
    let table = store.stage_table("s1").unwrap();
    table
        .insert_tiles(&[
            tile("a", 0, TileStatus::Processing),
            tile("b", 1, TileStatus::Incomplete),
            tile("c", 2, TileStatus::Failed),
        ])
        .unwrap();
    let task = TaskDefinition {
        id: "t1".to_string(),
        name: "t1".to_string(),
        script: "/bin/run".to_string(),
        interpreter: None,
        args: Vec::new(),
        expected_exit_code: 0,
        local_work_units: 1.0,
        cluster_work_units: 1.0,
    };
    let mut exec = table
        .create_task_execution(
            &worker(),
            &task,
            ExecutionStart {
                id: "e1".to_string(),
                tile_relative_path: "a".to_string(),
                resolved_args: Vec::new(),
                log_file: "/out/.log/a-e1.log".to_string(),
            },
        )
        .unwrap();
    exec.execution_status = ExecutionStatus::Running;
    table.update_task_execution(&exec).unwrap();

    let pool = Arc::new(WorkerPool::new(Duration::from_secs(30)));
    pool.upsert(worker()).await;

    IngressState {
        connectors: Arc::new(ConnectorCache::new(store.clone())),
        store,
        pool,
        chunk_size: 100,
    }
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn completion_report_completes_tile() {
    let state = test_state().await;
    let router = build_router(state.clone());

    let resp = router
        .oneshot(post_json(
            "/api/v1/executions/complete",
            serde_json::json!({
                "execution_id": "e1",
                "execution_status": "completed",
                "completion_result": "success",
                "exit_code": 0,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["data"]["tile_status"], "complete");

    let table = state.store.stage_table("s1").unwrap();
    assert_eq!(
        table.load_tile("a").unwrap().unwrap().this_stage_status,
        TileStatus::Complete
    );
}

#[tokio::test]
async fn completion_for_unknown_execution_is_404() {
    let router = build_router(test_state().await);
    let resp = router
        .oneshot(post_json(
            "/api/v1/executions/complete",
            serde_json::json!({
                "execution_id": "nope",
                "execution_status": "completed",
                "completion_result": "success",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn heartbeat_known_and_unknown_workers() {
    let state = test_state().await;

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/workers/w1/heartbeat",
            serde_json::json!({ "task_load": 1.5 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(state.pool.tracked_load("w1").await, Some(1.5));

    let resp = build_router(state)
        .oneshot(post_json("/api/v1/workers/ghost/heartbeat", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn worker_snapshot_lists_pool() {
    let resp = build_router(test_state().await)
        .oneshot(get("/api/v1/workers"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["data"][0]["id"], "w1");
}

#[tokio::test]
async fn stage_counts_and_missing_stage() {
    let state = test_state().await;

    let resp = build_router(state.clone())
        .oneshot(get("/api/v1/stages/s1/counts"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["data"]["processing"], 1);
    assert_eq!(body["data"]["incomplete"], 1);
    assert_eq!(body["data"]["failed"], 1);

    let resp = build_router(state)
        .oneshot(get("/api/v1/stages/ghost/counts"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn set_tile_status_by_paths_and_by_conversion() {
    let state = test_state().await;

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/status",
            serde_json::json!({ "relative_paths": ["b"], "status": "queued" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["data"]["changed"], 1);

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/status",
            serde_json::json!({ "from": "failed", "status": "incomplete" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let table = state.store.stage_table("s1").unwrap();
    assert_eq!(table.count_to_process().unwrap(), 1);
    assert_eq!(
        table.load_tile("c").unwrap().unwrap().this_stage_status,
        TileStatus::Incomplete
    );
}

#[tokio::test]
async fn invalid_status_requests_are_400() {
    let state = test_state().await;

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/status",
            serde_json::json!({ "relative_paths": ["b"], "status": "processing" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = build_router(state)
        .oneshot(post_json(
            "/api/v1/stages/s1/status",
            serde_json::json!({ "status": "incomplete" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn processing_toggles_and_dequeue() {
    let state = test_state().await;

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/projects/p1/processing",
            serde_json::json!({ "is_processing": true }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(state.store.get_project("p1").unwrap().unwrap().is_processing);

    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/processing",
            serde_json::json!({ "is_processing": true }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(state.store.get_stage("s1").unwrap().unwrap().is_processing);

    build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/status",
            serde_json::json!({ "relative_paths": ["b"], "status": "queued" }),
        ))
        .await
        .unwrap();
    let resp = build_router(state.clone())
        .oneshot(post_json(
            "/api/v1/stages/s1/dequeue",
            serde_json::json!({ "planes": [1] }),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["data"]["changed"], 1);
    let table = state.store.stage_table("s1").unwrap();
    assert_eq!(table.count_to_process().unwrap(), 0);
}

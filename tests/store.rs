//! Archive integration tests against a file-backed store

use netlens::schema::{Headers, OpenRequest, ResponseRecord};
use netlens::{ExchangeFilter, TrafficStore};
use std::sync::Arc;
use tempfile::TempDir;

fn open_request(method: &str, host: &str, timestamp_ms: i64) -> OpenRequest {
    OpenRequest {
        timestamp_ms,
        method: method.to_string(),
        url: format!("http://{host}/"),
        host: host.to_string(),
        path: "/".to_string(),
        request_headers: Headers::new(),
        request_body: None,
    }
}

fn response(status: u16) -> ResponseRecord {
    ResponseRecord {
        status,
        response_headers: Headers::new(),
        response_body: Some(b"body".to_vec()),
        content_type: Some("text/plain".to_string()),
        duration_ms: 3,
    }
}

#[test]
fn method_filter_returns_exactly_the_matching_row() {
    let dir = TempDir::new().unwrap();
    let store = TrafficStore::open(dir.path().join("traffic.db")).unwrap();

    for (method, ts) in [("GET", 1), ("POST", 2), ("GET", 3)] {
        let id = store.insert_open(&open_request(method, "api.test", ts)).unwrap();
        store.complete(id, &response(200)).unwrap();
    }

    let filter = ExchangeFilter {
        methods: vec!["POST".to_string()],
        ..Default::default()
    };
    let rows = store.query(&filter).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].method, "POST");
}

#[test]
fn sweep_removes_expired_rows_and_reports_the_count() {
    let dir = TempDir::new().unwrap();
    let store = TrafficStore::open(dir.path().join("traffic.db")).unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    store
        .insert_open(&open_request("GET", "old.test", now - 2 * 3_600_000))
        .unwrap();
    store
        .insert_open(&open_request("GET", "new.test", now - 30 * 60_000))
        .unwrap();

    assert_eq!(store.sweep_older_than(3_600_000).unwrap(), 1);

    let rows = store.query(&ExchangeFilter::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].host, "new.test");
}

#[test]
fn completed_exchanges_survive_reopen_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("traffic.db");

    let mut headers = Headers::new();
    headers.insert("X-Custom".to_string(), "As-Sent".to_string());
    let open = OpenRequest {
        timestamp_ms: 42,
        method: "PUT".to_string(),
        url: "https://api.test/v1/items".to_string(),
        host: "api.test".to_string(),
        path: "/v1/items".to_string(),
        request_headers: headers,
        request_body: Some(vec![0x00, 0xff, 0x7f]),
    };

    let id = {
        let store = TrafficStore::open(&path).unwrap();
        let id = store.insert_open(&open).unwrap();
        store
            .complete(
                id,
                &ResponseRecord {
                    status: 201,
                    response_headers: Headers::new(),
                    response_body: Some(vec![0xde, 0xad, 0xbe, 0xef]),
                    content_type: Some("application/octet-stream".to_string()),
                    duration_ms: 7,
                },
            )
            .unwrap();
        id
    };

    let store = TrafficStore::open(&path).unwrap();
    let row = store.get_by_id(id).unwrap().unwrap();
    assert_eq!(row.request_headers, open.request_headers);
    assert_eq!(row.request_body, open.request_body);
    assert_eq!(row.response_body.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    assert_eq!(row.status, 201);
    assert_eq!(row.size_bytes, 4);
}

#[test]
fn concurrent_inserts_get_unique_increasing_ids() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TrafficStore::open(dir.path().join("traffic.db")).unwrap());

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..25 {
                let ts = (worker * 100 + i) as i64;
                ids.push(store.insert_open(&open_request("GET", "c.test", ts)).unwrap());
            }
            ids
        }));
    }

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 200, "ids must be unique");
    assert_eq!(store.count(&ExchangeFilter::default()).unwrap(), 200);
}

#[test]
fn settings_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("traffic.db");

    {
        let store = TrafficStore::open(&path).unwrap();
        store.set_setting("retention_hours", "72").unwrap();
    }

    let store = TrafficStore::open(&path).unwrap();
    assert_eq!(
        store.get_setting("retention_hours").unwrap().as_deref(),
        Some("72")
    );
}

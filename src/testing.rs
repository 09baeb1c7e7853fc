//! In-crate fakes for the remote API and connectivity.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::db::RecordStore;
use crate::error::{Result, SyncError};
use crate::sync::connectivity::Connectivity;
use crate::sync::remote::{ApiResponse, RemoteApi, RequestOptions};

pub(crate) async fn test_store() -> (RecordStore, TempDir) {
    let temp = tempfile::tempdir().unwrap();
    let store = RecordStore::open(&temp.path().join("test.db"), Duration::from_secs(5))
        .await
        .unwrap();
    (store, temp)
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub endpoint: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
enum Mode {
    Succeed,
    Status(u16),
    Conflict(Value),
    Connectivity,
}

/// Records every call. By default POST echoes the payload with a fresh id,
/// PUT echoes it with a bumped version, GET returns the configured records.
pub(crate) struct FakeRemote {
    calls: Mutex<Vec<RecordedCall>>,
    mode: Mutex<Mode>,
    records: Mutex<Vec<Value>>,
    next_id: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            mode: Mutex::new(Mode::Succeed),
            records: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    pub fn succeed(&self) {
        *self.mode.lock().unwrap() = Mode::Succeed;
    }

    pub fn fail_with_status(&self, status: u16) {
        *self.mode.lock().unwrap() = Mode::Status(status);
    }

    /// Writes answer 409 with `current` as the body.
    pub fn fail_with_conflict(&self, current: Value) {
        *self.mode.lock().unwrap() = Mode::Conflict(current);
    }

    pub fn fail_with_connectivity(&self) {
        *self.mode.lock().unwrap() = Mode::Connectivity;
    }

    /// Records served by GET.
    pub fn set_records(&self, records: Vec<Value>) {
        *self.records.lock().unwrap() = records;
    }

    fn respond(&self, method: &'static str, endpoint: &str, payload: Value) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            Mode::Status(status) => return Err(SyncError::remote(status, "scripted failure")),
            Mode::Connectivity => return Err(SyncError::Connectivity),
            Mode::Conflict(current) if method != "GET" => {
                return Err(SyncError::remote(409, current.to_string()))
            }
            _ => {}
        }

        match method {
            "GET" => Ok(ApiResponse::new(
                200,
                Value::Array(self.records.lock().unwrap().clone()),
            )),
            "POST" => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut body = payload;
                if let Value::Object(map) = &mut body {
                    map.insert("id".to_string(), json!(format!("srv-{}", n)));
                    map.insert("version".to_string(), json!(1));
                }
                Ok(ApiResponse::new(201, body))
            }
            "PUT" => {
                let mut body = payload;
                if let Value::Object(map) = &mut body {
                    let base = map.get("baseVersion").and_then(Value::as_i64).unwrap_or(0);
                    map.insert("version".to_string(), json!(base + 1));
                    if let Some(id) = endpoint.rsplit('/').next() {
                        map.insert("id".to_string(), json!(id));
                    }
                }
                Ok(ApiResponse::new(200, body))
            }
            _ => Ok(ApiResponse::new(204, Value::Null)),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn get(&self, endpoint: &str, _opts: &RequestOptions) -> Result<ApiResponse> {
        self.respond("GET", endpoint, Value::Null)
    }

    async fn post(&self, endpoint: &str, payload: &Value, _opts: &RequestOptions) -> Result<ApiResponse> {
        self.respond("POST", endpoint, payload.clone())
    }

    async fn put(&self, endpoint: &str, payload: &Value, _opts: &RequestOptions) -> Result<ApiResponse> {
        self.respond("PUT", endpoint, payload.clone())
    }

    async fn delete(&self, endpoint: &str, _opts: &RequestOptions) -> Result<ApiResponse> {
        self.respond("DELETE", endpoint, Value::Null)
    }

    async fn upload_file(
        &self,
        endpoint: &str,
        file_name: &str,
        bytes: Vec<u8>,
        _opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        self.respond(
            "UPLOAD",
            endpoint,
            json!({ "file_name": file_name, "size": bytes.len() }),
        )
    }
}

/// Connectivity that can drop after a set number of checks.
pub(crate) struct FakeConnectivity {
    online: AtomicBool,
    checks: AtomicUsize,
    offline_after: Mutex<Option<usize>>,
    tx: watch::Sender<bool>,
}

impl FakeConnectivity {
    pub fn new(online: bool) -> Arc<Self> {
        let (tx, _rx) = watch::channel(online);
        Arc::new(Self {
            online: AtomicBool::new(online),
            checks: AtomicUsize::new(0),
            offline_after: Mutex::new(None),
            tx,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        *self.offline_after.lock().unwrap() = None;
        self.tx.send_replace(online);
    }

    /// Stays online for the next `checks` calls to `is_connected`.
    pub fn go_offline_after(&self, checks: usize) {
        let used = self.checks.load(Ordering::SeqCst);
        *self.offline_after.lock().unwrap() = Some(used + checks);
    }
}

impl Connectivity for FakeConnectivity {
    fn is_connected(&self) -> bool {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        match *self.offline_after.lock().unwrap() {
            Some(limit) if n > limit => false,
            _ => self.online.load(Ordering::SeqCst),
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

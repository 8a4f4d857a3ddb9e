/// Test doubles for the adapter boundaries
///
/// Enabled for this crate's own tests and, through the `testing` feature,
/// for crates that drive the adapters without real processes, serial ports
/// or a remote store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::process::{ProcessLauncher, ProcessSink};
use crate::repository::{Listing, ObjectStore, Result as StoreResult, StoreError};
use crate::session::{SerialConnector, SerialLink, MFG_PROMPT};

struct Launch {
    args: Vec<String>,
    timeout: Option<Duration>,
    sink: Option<ProcessSink>,
}

/// Records launches; the test decides what each process prints and when it exits
#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<Vec<Launch>>,
}

impl FakeLauncher {
    /// Arguments of every launch so far, in order
    pub fn launched(&self) -> Vec<Vec<String>> {
        self.launches.lock().unwrap().iter().map(|launch| launch.args.clone()).collect()
    }

    pub fn timeout(&self, index: usize) -> Option<Duration> {
        self.launches.lock().unwrap()[index].timeout
    }

    /// Number of launched processes that have not exited yet
    pub fn running(&self) -> usize {
        self.launches.lock().unwrap().iter().filter(|launch| launch.sink.is_some()).count()
    }

    /// Print `chunk` on the stdout of launch `index`
    pub fn emit(&self, index: usize, chunk: &str) {
        let sink = self.launches.lock().unwrap()[index].sink.take();
        let Some(mut sink) = sink else {
            panic!("launch {index} has already exited");
        };
        sink.data(chunk);
        self.launches.lock().unwrap()[index].sink = Some(sink);
    }

    /// Exit launch `index` with `code`
    pub fn finish(&self, index: usize, code: Option<i32>) {
        let sink = self.launches.lock().unwrap()[index].sink.take();
        match sink {
            Some(sink) => sink.close(code),
            None => panic!("launch {index} has already exited"),
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, _program: &Path, args: &[String], timeout: Option<Duration>, sink: ProcessSink) {
        self.launches.lock().unwrap().push(Launch {
            args: args.to_vec(),
            timeout,
            sink: Some(sink),
        });
    }
}

/// In-memory object store with injectable failures
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    fail_listing: Mutex<bool>,
    truncated: Mutex<bool>,
}

impl MemoryStore {
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    /// Make downloads of `key` fail
    pub fn fail_key(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().unwrap() = fail;
    }

    pub fn report_truncated(&self, truncated: bool) {
        *self.truncated.lock().unwrap() = truncated;
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: Option<&str>) -> StoreResult<Listing> {
        if *self.fail_listing.lock().unwrap() {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "store offline")));
        }
        let keys = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| prefix.map_or(true, |prefix| key.starts_with(prefix)))
            .cloned()
            .collect();
        Ok(Listing {
            keys,
            truncated: *self.truncated.lock().unwrap(),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        if self.failing.lock().unwrap().contains(key) {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::TimedOut, "download timed out")));
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))
    }
}

/// Serial connector whose device answers `mfg` commands from a reply table
///
/// Commands without a reply get an empty response followed by the prompt.
#[derive(Default)]
pub struct ScriptedSerial {
    replies: Mutex<HashMap<String, String>>,
    commands: Arc<Mutex<Vec<String>>>,
    fail_open: Mutex<bool>,
}

impl ScriptedSerial {
    /// Answer `mfg <command>` with `reply`; the prompt is appended
    pub fn reply(&self, command: &str, reply: &str) {
        self.replies.lock().unwrap().insert(command.to_string(), reply.to_string());
    }

    pub fn fail_open(&self, fail: bool) {
        *self.fail_open.lock().unwrap() = fail;
    }

    /// Command lines received so far, without the trailing newline
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SerialConnector for ScriptedSerial {
    async fn open(&self, device: &str, _baud: u32) -> io::Result<Box<dyn SerialLink>> {
        if *self.fail_open.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{device} not present")));
        }

        let (host, mut device_end) = tokio::io::duplex(4096);
        let replies = self.replies.lock().unwrap().clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 128];
            while !received.contains(&b'\n') {
                match device_end.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }

            let line = String::from_utf8_lossy(&received).trim().to_string();
            commands.lock().unwrap().push(line.clone());
            let command = line.strip_prefix("mfg ").unwrap_or(&line);
            let reply = replies.get(command).cloned().unwrap_or_default();
            let response = format!("{}\r\n{}\r\n", reply.trim_end(), MFG_PROMPT);
            let _ = device_end.write_all(response.as_bytes()).await;
        });

        Ok(Box::new(host))
    }
}

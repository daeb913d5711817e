//! In-memory kernel for driving the probe lifecycle without privileges.
//!
//! Every operation is recorded in a log and can be made to fail by name:
//! `channel open`, `channel close`, `hook load`, `verifier`, `hook close`,
//! `config <key>`, `qdisc add`, `qdisc delete`, `filter replace <direction>`,
//! `filter delete <direction>`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flowlat::ebpf::{ConfigTable, EventSource, Hook, HookLoader};
use flowlat::netlink::ControlChannel;
use flowlat::tc::{Filter, Interface, ProgramHandle, Qdisc};
use flowlat::{FlowlatError, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const EEXIST: i32 = 17;
const ENOENT: i32 = 2;
const EINVAL: i32 = 22;

#[derive(Default)]
pub struct KernelState {
    pub qdiscs: Vec<Qdisc>,
    pub filters: Vec<Filter>,
    pub log: Vec<String>,
    pub fail: HashSet<String>,
    pub open_channels: usize,
    pub open_hooks: usize,
    events: Option<mpsc::UnboundedReceiver<Result<Bytes>>>,
}

impl KernelState {
    fn record(&mut self, op: impl Into<String>) -> std::result::Result<(), ()> {
        let op = op.into();
        let failed = self.fail.contains(&op);
        self.log.push(op);
        if failed {
            Err(())
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
    events: mpsc::UnboundedSender<Result<Bytes>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let state = KernelState {
            events: Some(rx),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, op: &str) {
        self.state().fail.insert(op.to_string());
    }

    pub fn opener(&self) -> impl FnOnce() -> Result<FakeChannel> {
        let kernel = self.clone();
        move || {
            let mut state = kernel.state();
            if state.record("channel open").is_err() {
                return Err(FlowlatError::ControlChannel(std::io::Error::from(
                    std::io::ErrorKind::PermissionDenied,
                )));
            }
            state.open_channels += 1;
            drop(state);
            Ok(FakeChannel { kernel })
        }
    }

    pub fn loader(&self) -> FakeLoader {
        FakeLoader {
            kernel: self.clone(),
        }
    }

    pub fn emit(&self, record: &'static [u8]) {
        let _ = self.events.send(Ok(Bytes::from_static(record)));
    }

    pub fn emit_error(&self, message: &str) {
        let _ = self
            .events
            .send(Err(FlowlatError::EventRead(message.to_string())));
    }

    pub fn qdisc_count(&self) -> usize {
        self.state().qdiscs.len()
    }

    pub fn filter_count(&self) -> usize {
        self.state().filters.len()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().log.iter().filter(|entry| *entry == op).count()
    }

    pub fn position(&self, op: &str) -> Option<usize> {
        self.state().log.iter().position(|entry| entry == op)
    }

    /// Nothing left in the kernel and every handle released.
    pub fn is_clean(&self) -> bool {
        let state = self.state();
        state.qdiscs.is_empty()
            && state.filters.is_empty()
            && state.open_channels == 0
            && state.open_hooks == 0
    }
}

fn netlink_error(operation: &'static str, link_index: u32, errno: i32) -> FlowlatError {
    FlowlatError::Netlink {
        operation,
        link_index,
        errno: Some(errno),
        message: std::io::Error::from_raw_os_error(errno).to_string(),
    }
}

pub fn test_interface() -> Interface {
    Interface::new(7, "veth-test")
}

pub struct FakeChannel {
    kernel: FakeKernel,
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn add_qdisc(&mut self, qdisc: &Qdisc) -> Result<()> {
        let mut state = self.kernel.state();
        if state.record("qdisc add").is_err() {
            return Err(netlink_error("qdisc add", qdisc.link_index, EINVAL));
        }
        if state.qdiscs.iter().any(|q| q.link_index == qdisc.link_index) {
            return Err(netlink_error("qdisc add", qdisc.link_index, EEXIST));
        }
        state.qdiscs.push(qdisc.clone());
        Ok(())
    }

    async fn delete_qdisc(&mut self, qdisc: &Qdisc) -> Result<()> {
        let mut state = self.kernel.state();
        if state.record("qdisc delete").is_err() {
            return Err(netlink_error("qdisc delete", qdisc.link_index, EINVAL));
        }
        let before = state.qdiscs.len();
        state.qdiscs.retain(|q| q != qdisc);
        if state.qdiscs.len() == before {
            return Err(netlink_error("qdisc delete", qdisc.link_index, ENOENT));
        }
        state.filters.retain(|f| f.link_index != qdisc.link_index);
        Ok(())
    }

    async fn replace_filter(&mut self, filter: &Filter) -> Result<()> {
        let mut state = self.kernel.state();
        if state
            .record(format!("filter replace {}", filter.direction))
            .is_err()
        {
            return Err(netlink_error("filter replace", filter.link_index, EINVAL));
        }
        if !state.qdiscs.iter().any(|q| q.link_index == filter.link_index) {
            return Err(netlink_error("filter replace", filter.link_index, EINVAL));
        }
        state.filters.retain(|f| !f.same_slot(filter));
        state.filters.push(filter.clone());
        Ok(())
    }

    async fn delete_filter(&mut self, filter: &Filter) -> Result<()> {
        let mut state = self.kernel.state();
        if state
            .record(format!("filter delete {}", filter.direction))
            .is_err()
        {
            return Err(netlink_error("filter delete", filter.link_index, EINVAL));
        }
        let before = state.filters.len();
        state.filters.retain(|f| !f.same_slot(filter));
        if state.filters.len() == before {
            return Err(netlink_error("filter delete", filter.link_index, ENOENT));
        }
        Ok(())
    }

    async fn close(self) -> Result<()> {
        let mut state = self.kernel.state();
        state.open_channels -= 1;
        if state.record("channel close").is_err() {
            return Err(FlowlatError::ControlChannel(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        Ok(())
    }
}

pub struct FakeLoader {
    kernel: FakeKernel,
}

impl HookLoader for FakeLoader {
    type Hook = FakeHook;

    fn load(&self) -> Result<FakeHook> {
        let mut state = self.kernel.state();
        if state.record("hook load").is_err() {
            return Err(FlowlatError::ProgramLoadFailed(
                "probe program not found in probe object".to_string(),
            ));
        }
        if state.fail.contains("verifier") {
            return Err(FlowlatError::Verifier {
                program: "probe".to_string(),
                reason: "Permission denied (os error 13)".to_string(),
                log: "0: (95) exit\nR0 !read_ok\nprocessed 1 insns".to_string(),
            });
        }
        state.open_hooks += 1;
        let events = state.events.take().map(|rx| FakeEvents { rx });
        drop(state);

        Ok(FakeHook {
            program: ProgramHandle {
                fd: 42,
                name: "probe".to_string(),
            },
            table: FakeTable {
                kernel: self.kernel.clone(),
                entries: BTreeMap::new(),
            },
            events,
            kernel: self.kernel.clone(),
        })
    }
}

pub struct FakeHook {
    program: ProgramHandle,
    table: FakeTable,
    events: Option<FakeEvents>,
    kernel: FakeKernel,
}

impl Hook for FakeHook {
    type Table = FakeTable;
    type Events = FakeEvents;

    fn program(&self) -> &ProgramHandle {
        &self.program
    }

    fn config_table(&mut self) -> &mut FakeTable {
        &mut self.table
    }

    fn take_events(&mut self) -> Result<FakeEvents> {
        self.events
            .take()
            .ok_or_else(|| FlowlatError::HookObject("event ring already taken".to_string()))
    }

    fn close(self) -> Result<()> {
        let mut state = self.kernel.state();
        state.open_hooks -= 1;
        if state.record("hook close").is_err() {
            return Err(FlowlatError::HookObject("program fd already closed".to_string()));
        }
        Ok(())
    }
}

pub struct FakeTable {
    kernel: FakeKernel,
    entries: BTreeMap<u32, u8>,
}

impl ConfigTable for FakeTable {
    fn set(&mut self, key: u32, value: u8) -> Result<()> {
        if self.kernel.state().record(format!("config {key}")).is_err() {
            return Err(FlowlatError::HookObject("E2BIG".to_string()));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    fn get(&self, key: u32) -> Result<u8> {
        self.entries
            .get(&key)
            .copied()
            .ok_or_else(|| FlowlatError::HookObject(format!("no entry for key {key}")))
    }
}

pub struct FakeEvents {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

#[async_trait]
impl EventSource for FakeEvents {
    async fn next_record(&mut self) -> Result<Bytes> {
        match self.rx.recv().await {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }
}

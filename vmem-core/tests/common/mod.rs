//! Shared fixtures: an in-process hypervisor model behind the monitor traits.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use vmem_core::error::{Result, VmemError};
use vmem_core::qmp::{MonitorConnector, MonitorSession, QmpCommand, QmpEvent};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Failure injected into the next command with a given name.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Explicit error reply; nothing applied.
    Reject,
    /// No reply in time. `applied` says whether the hypervisor acted anyway.
    Timeout { applied: bool },
}

#[derive(Default)]
struct Hypervisor {
    base_memory: u64,
    objects: BTreeMap<String, u64>,
    /// device id -> (memdev, size)
    dimms: BTreeMap<String, (String, u64)>,
    balloon: Option<u64>,
    log: Vec<QmpCommand>,
    events: VecDeque<QmpEvent>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    auto_unplug: bool,
    connect_failures: u32,
    handshake_broken: bool,
    connects: u32,
    /// Bumped on hangup; sessions from an earlier generation are dead.
    generation: u32,
}

impl Hypervisor {
    fn apply(&mut self, command: &QmpCommand) -> Result<Value> {
        let reject = |desc: String| VmemError::CommandFailed {
            command: command.name().to_string(),
            class: "GenericError".into(),
            desc,
        };

        match command {
            QmpCommand::Capabilities => Ok(json!({})),
            QmpCommand::ObjectAdd { id, size } => {
                if self.objects.contains_key(id) {
                    return Err(reject(format!("attempt to add duplicate property '{}'", id)));
                }
                self.objects.insert(id.clone(), *size);
                Ok(json!({}))
            }
            QmpCommand::ObjectDel { id } => {
                if self.dimms.values().any(|(memdev, _)| memdev == id) {
                    return Err(reject(format!("object '{}' is in use", id)));
                }
                if self.objects.remove(id).is_none() {
                    return Err(reject(format!("object '{}' not found", id)));
                }
                Ok(json!({}))
            }
            QmpCommand::DeviceAdd { id, memdev } => {
                if self.dimms.contains_key(id) {
                    return Err(reject(format!("Duplicate device ID '{}'", id)));
                }
                let Some(size) = self.objects.get(memdev).copied() else {
                    return Err(reject(format!("can't find memdev '{}'", memdev)));
                };
                self.dimms.insert(id.clone(), (memdev.clone(), size));
                Ok(json!({}))
            }
            QmpCommand::DeviceDel { id } => {
                if !self.dimms.contains_key(id) {
                    return Err(VmemError::CommandFailed {
                        command: command.name().to_string(),
                        class: "DeviceNotFound".into(),
                        desc: format!("Device '{}' not found", id),
                    });
                }
                if self.auto_unplug {
                    self.unplug(id);
                }
                Ok(json!({}))
            }
            QmpCommand::Balloon { value } => {
                self.balloon = Some(*value);
                Ok(json!({}))
            }
            QmpCommand::QueryBalloon => Ok(json!({ "actual": self.actual() })),
            QmpCommand::QueryMemoryDevices => {
                let devices: Vec<Value> = self
                    .dimms
                    .iter()
                    .enumerate()
                    .map(|(i, (id, (memdev, size)))| {
                        json!({
                            "type": "dimm",
                            "data": {
                                "id": id,
                                "size": size,
                                "memdev": format!("/objects/{}", memdev),
                                "slot": i,
                                "hotplugged": true,
                                "hotpluggable": true
                            }
                        })
                    })
                    .collect();
                Ok(Value::Array(devices))
            }
            QmpCommand::QueryMemorySizeSummary => Ok(json!({
                "base-memory": self.base_memory,
                "plugged-memory": self.plugged(),
            })),
        }
    }

    fn plugged(&self) -> u64 {
        self.dimms.values().map(|(_, size)| size).sum()
    }

    fn actual(&self) -> u64 {
        self.balloon.unwrap_or(self.base_memory + self.plugged())
    }

    fn unplug(&mut self, id: &str) {
        if self.dimms.remove(id).is_some() {
            self.events.push_back(QmpEvent {
                event: "DEVICE_DELETED".into(),
                data: json!({ "device": id, "path": format!("/machine/peripheral/{}", id) }),
                timestamp: json!({ "seconds": 0, "microseconds": 0 }),
            });
        }
    }
}

/// Handle to a simulated hypervisor shared by every session it hands out.
#[derive(Clone)]
pub struct MockHypervisor {
    inner: Arc<Mutex<Hypervisor>>,
}

impl MockHypervisor {
    pub fn new(base_memory: u64) -> Self {
        let hv = Hypervisor { base_memory, ..Default::default() };
        Self { inner: Arc::new(Mutex::new(hv)) }
    }

    pub fn session(&self) -> MockSession {
        let generation = self.inner.lock().unwrap().generation;
        MockSession { inner: self.inner.clone(), generation }
    }

    /// Close every open session, as a restarted monitor would.
    pub fn hang_up(&self) {
        self.inner.lock().unwrap().generation += 1;
    }

    pub fn connector(&self) -> Box<dyn MonitorConnector> {
        Box::new(MockConnector { inner: self.inner.clone() })
    }

    pub fn fail_next(&self, command: &'static str, fault: Fault) {
        let mut hv = self.inner.lock().unwrap();
        hv.faults.entry(command).or_default().push_back(fault);
    }

    pub fn fail_connects(&self, count: u32) {
        self.inner.lock().unwrap().connect_failures = count;
    }

    pub fn break_handshake(&self) {
        self.inner.lock().unwrap().handshake_broken = true;
    }

    pub fn set_auto_unplug(&self, on: bool) {
        self.inner.lock().unwrap().auto_unplug = on;
    }

    /// Guest released the DIMM: remove it and emit `DEVICE_DELETED`.
    pub fn complete_unplug(&self, id: &str) {
        self.inner.lock().unwrap().unplug(id);
    }

    /// Plug a DIMM behind the controller's back.
    pub fn plug(&self, slot: usize, size: u64) {
        let mut hv = self.inner.lock().unwrap();
        let memdev = format!("mem-slot{}", slot);
        hv.objects.insert(memdev.clone(), size);
        hv.dimms.insert(format!("dimm-slot{}", slot), (memdev, size));
    }

    /// Names of all commands received, in order.
    pub fn commands(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().log.iter().map(QmpCommand::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands().iter().filter(|c| **c == name).count()
    }

    pub fn clear_log(&self) {
        self.inner.lock().unwrap().log.clear();
    }

    pub fn dimm_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().dimms.keys().cloned().collect()
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn balloon(&self) -> Option<u64> {
        self.inner.lock().unwrap().balloon
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().unwrap().connects
    }
}

pub struct MockSession {
    inner: Arc<Mutex<Hypervisor>>,
    generation: u32,
}

#[async_trait]
impl MonitorSession for MockSession {
    async fn execute(&mut self, command: &QmpCommand, timeout: Duration) -> Result<Value> {
        let mut hv = self.inner.lock().unwrap();
        if hv.generation != self.generation {
            return Err(VmemError::NotConnected);
        }
        hv.log.push(command.clone());

        let fault = hv.faults.get_mut(command.name()).and_then(VecDeque::pop_front);
        let timed_out = || VmemError::CommandTimeout {
            command: command.name().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match fault {
            None => hv.apply(command),
            Some(Fault::Reject) => Err(VmemError::CommandFailed {
                command: command.name().to_string(),
                class: "GenericError".into(),
                desc: "injected failure".into(),
            }),
            Some(Fault::Timeout { applied }) => {
                if applied {
                    let _ = hv.apply(command);
                }
                Err(timed_out())
            }
        }
    }

    async fn drain_events(&mut self) -> Result<Vec<QmpEvent>> {
        let mut hv = self.inner.lock().unwrap();
        if hv.generation != self.generation {
            return Err(VmemError::NotConnected);
        }
        Ok(hv.events.drain(..).collect())
    }
}

struct MockConnector {
    inner: Arc<Mutex<Hypervisor>>,
}

#[async_trait]
impl MonitorConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn MonitorSession>> {
        let mut hv = self.inner.lock().unwrap();
        hv.connects += 1;
        if hv.connect_failures > 0 {
            hv.connect_failures -= 1;
            return Err(VmemError::ConnectionFailed {
                socket: "/nonexistent/monitor.sock".into(),
                reason: "Connection refused".into(),
            });
        }
        if hv.handshake_broken {
            return Err(VmemError::HandshakeFailed { reason: "no greeting".into() });
        }
        let generation = hv.generation;
        Ok(Box::new(MockSession { inner: self.inner.clone(), generation }))
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

/// Write a status record the way the guest agent does: temp file, then rename.
pub fn write_status(path: &Path, total_kb: u64, free_kb: u64, seq_id: u64) {
    let record = json!({
        "total_kb": total_kb,
        "free_kb": free_kb,
        "available_kb": free_kb,
        "timestamp": unix_now(),
        "seq_id": seq_id,
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, record.to_string()).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

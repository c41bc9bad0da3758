// State channel between processing units and the unit maintainer.
// Units update a small key/value snapshot and push reports; the
// maintainer consumes them to arbitrate the worker's global readiness.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::proc_unit::UnitState;

/// One published observation of a unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub ident: String,
    pub state: UnitState,
    pub data: BTreeMap<String, String>,
}

/// A unit's handle onto the channel.
pub struct ChannelEntry {
    ident: String,
    data: Mutex<BTreeMap<String, String>>,
    tx: mpsc::Sender<UnitReport>,
}

impl ChannelEntry {
    pub fn new(ident: impl Into<String>, tx: mpsc::Sender<UnitReport>) -> Self {
        Self {
            ident: ident.into(),
            data: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn update(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn data(&self) -> BTreeMap<String, String> {
        self.data.lock().unwrap().clone()
    }

    /// Push the current snapshot with the given state to the maintainer.
    pub async fn publish(&self, state: UnitState) {
        let report = UnitReport {
            ident: self.ident.clone(),
            state,
            data: self.data(),
        };
        let _ = self.tx.send(report).await;
    }
}

/// Constructor side: hands entries to units and the receiver to the
/// maintainer.
pub struct Channel {
    tx: mpsc::Sender<UnitReport>,
    rx: Option<mpsc::Receiver<UnitReport>>,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }

    pub fn entry(&self, ident: &str) -> ChannelEntry {
        ChannelEntry::new(ident, self.tx.clone())
    }

    pub fn take_receiver(&mut self) -> mpsc::Receiver<UnitReport> {
        self.rx.take().expect("channel receiver already taken")
    }
}

// The worker's letter pump and unit supervision: inbound letters are
// routed by type to the installed processing units, control commands are
// handled inline, and the unit maintainer arbitrates the worker's global
// readiness towards the master.

use std::collections::HashMap;
use std::sync::Arc;

use forge_common::letter::{
    CancelKind, CmdResponseContent, CmdResponseHeader, CmdResponseLetter, CommandKind,
    CommandLetter, Letter, NotifyLetter, CMD_RESPONSE_SUCCESS, WSC_STATE_PENDING,
    WSC_STATE_READY,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::UnitReport;
use crate::output::Output;
use crate::proc_unit::{ProcUnit, UnitState};

pub struct Processor {
    worker_name: String,
    output: Arc<dyn Output>,
    units: HashMap<String, Arc<dyn ProcUnit>>,
    /// Letter type -> unit ident.
    dispatch: HashMap<String, String>,
}

impl Processor {
    pub fn new(worker_name: impl Into<String>, output: Arc<dyn Output>) -> Self {
        Self {
            worker_name: worker_name.into(),
            output,
            units: HashMap::new(),
            dispatch: HashMap::new(),
        }
    }

    pub fn install_unit(&mut self, unit: Arc<dyn ProcUnit>) {
        self.units.insert(unit.ident().to_string(), unit);
    }

    /// Route a letter type to a unit. Unknown units are a wiring error.
    pub fn dispatch_to(&mut self, letter_type: &str, unit_ident: &str) {
        assert!(
            self.units.contains_key(unit_ident),
            "unit {unit_ident} is not installed"
        );
        self.dispatch
            .insert(letter_type.to_string(), unit_ident.to_string());
    }

    pub fn units(&self) -> Vec<Arc<dyn ProcUnit>> {
        self.units.values().cloned().collect()
    }

    /// Start every unit and pump the request queue until cancelled.
    pub async fn run(self, mut req_rx: mpsc::Receiver<Letter>, cancel: CancellationToken) {
        for unit in self.units.values() {
            tokio::spawn(unit.clone().run(cancel.clone()));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                letter = req_rx.recv() => {
                    match letter {
                        Some(letter) => self.handle_letter(letter).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Process one inbound letter: commands inline, everything else to
    /// the unit registered for its type.
    pub async fn handle_letter(&self, letter: Letter) {
        match letter {
            Letter::Command(cmd) => self.command_proc(cmd).await,

            Letter::Cancel(cancel_letter) => {
                let unit_key = match cancel_letter.header.kind {
                    CancelKind::Single => "new",
                    CancelKind::Post => "Post",
                };
                if let Some(unit) = self.unit_for(unit_key) {
                    unit.cancel(&cancel_letter.header.task_id).await;
                }
            }

            other => {
                let type_name = other.type_name();
                match self.unit_for(type_name) {
                    Some(unit) => {
                        // Overload and deny are reported through the
                        // unit's channel; nothing to do here but log.
                        if let Err(e) = unit.core().proc(other).await {
                            tracing::warn!("unit refused letter: {e}");
                        }
                    }
                    None => {
                        tracing::debug!("no unit for letter type '{type_name}'");
                    }
                }
            }
        }
    }

    fn unit_for(&self, letter_type: &str) -> Option<Arc<dyn ProcUnit>> {
        self.dispatch
            .get(letter_type)
            .and_then(|ident| self.units.get(ident))
            .cloned()
    }

    async fn command_proc(&self, cmd: CommandLetter) {
        match cmd.header.kind {
            CommandKind::Accept => {
                tracing::info!("session accepted; resuming with state intact");
            }
            CommandKind::AcceptRst => {
                tracing::info!("session accepted with reset; discarding unit state");
                for unit in self.units.values() {
                    unit.reset().await;
                }
            }
            CommandKind::CancelJob => {
                for unit in self.units.values() {
                    unit.cancel(&cmd.header.target).await;
                }
            }
        }

        let ack = Letter::CmdResponse(CmdResponseLetter {
            header: CmdResponseHeader {
                ident: self.worker_name.clone(),
                kind: cmd.header.kind,
                state: CMD_RESPONSE_SUCCESS.to_string(),
                target: cmd.header.target.clone(),
            },
            content: CmdResponseContent::default(),
        });
        if let Err(e) = self.output.send(ack).await {
            tracing::debug!("command ack failed: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Unit maintainer
// ---------------------------------------------------------------------------

/// Watches unit reports and reports the worker's aggregate readiness to
/// the master: any unit in DENY/STOP/DIRTY/EXCEP parks the worker as
/// PENDING; once every unit is READY again the worker is re-offered.
pub struct UnitMaintainer {
    units: Vec<Arc<dyn ProcUnit>>,
    output: Arc<dyn Output>,
    worker_name: String,
}

impl UnitMaintainer {
    pub fn new(
        units: Vec<Arc<dyn ProcUnit>>,
        output: Arc<dyn Output>,
        worker_name: impl Into<String>,
    ) -> Self {
        Self {
            units,
            output,
            worker_name: worker_name.into(),
        }
    }

    fn is_troubled(state: UnitState) -> bool {
        matches!(
            state,
            UnitState::Deny | UnitState::Stop | UnitState::Dirty | UnitState::Excep
        )
    }

    async fn report(&self, state: &str) {
        let letter = Letter::Notify(NotifyLetter::wsc(&self.worker_name, state));
        if let Err(e) = self.output.send(letter).await {
            tracing::error!("WSC report failed: {e:#}");
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<UnitReport>, cancel: CancellationToken) {
        let mut pending = false;

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => return,
                report = rx.recv() => {
                    match report {
                        Some(report) => report,
                        None => return,
                    }
                }
            };

            if Self::is_troubled(report.state) {
                if !pending {
                    pending = true;
                    self.report(WSC_STATE_PENDING).await;
                }

                // Recover what can be recovered: a dirty unit goes back
                // to READY once its workspace cleans up.
                for unit in &self.units {
                    if unit.core().state() == UnitState::Dirty && unit.cleanup().await {
                        unit.core().set_state_notify(UnitState::Ready).await;
                    }
                }
                continue;
            }

            let all_ready = self
                .units
                .iter()
                .all(|u| u.core().state() == UnitState::Ready);
            if pending && all_ready {
                pending = false;
                self.report(WSC_STATE_READY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::job_unit::{JobProcUnit, JOB_UNIT_IDENT};
    use crate::test_support::{new_task_letter, worker_config, FakeOutput};
    use forge_common::letter::{CancelHeader, CancelLetter};

    fn processor_with_job_unit(
        dir: &std::path::Path,
    ) -> (Processor, Arc<JobProcUnit>, Arc<FakeOutput>, Channel) {
        let mut channel = Channel::new(64);
        let _ = channel.take_receiver();
        let output = FakeOutput::new();
        let config = Arc::new(worker_config(dir));
        let unit = JobProcUnit::new(
            config,
            output.clone(),
            "w1",
            channel.entry(JOB_UNIT_IDENT),
        );

        let mut processor = Processor::new("w1", output.clone());
        processor.install_unit(unit.clone());
        processor.dispatch_to("new", JOB_UNIT_IDENT);
        (processor, unit, output, channel)
    }

    #[tokio::test]
    async fn test_letters_route_to_dispatched_unit() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, unit, _output, _channel) = processor_with_job_unit(dir.path());

        processor
            .handle_letter(Letter::NewTask(new_task_letter(
                "1_A", "sn", "v1", vec![], "out", false,
            )))
            .await;
        assert_eq!(unit.core().queue_len(), 1);

        // A type without a routing entry is dropped quietly.
        processor
            .handle_letter(Letter::Notify(NotifyLetter::wsc("w1", "READY")))
            .await;
        assert_eq!(unit.core().queue_len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_letter_routed_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, unit, _output, _channel) = processor_with_job_unit(dir.path());

        processor
            .handle_letter(Letter::NewTask(new_task_letter(
                "1_A", "sn", "v1", vec![], "out", false,
            )))
            .await;
        assert_eq!(unit.core().queue_len(), 1);

        processor
            .handle_letter(Letter::Cancel(CancelLetter {
                header: CancelHeader {
                    task_id: "1_A".into(),
                    kind: CancelKind::Single,
                },
                content: Default::default(),
            }))
            .await;
        assert_eq!(unit.core().queue_len(), 0);
    }

    #[tokio::test]
    async fn test_accept_rst_resets_units() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, unit, _output, _channel) = processor_with_job_unit(dir.path());

        processor
            .handle_letter(Letter::NewTask(new_task_letter(
                "1_A", "sn", "v1", vec![], "out", false,
            )))
            .await;
        assert_eq!(unit.core().queue_len(), 1);

        processor
            .handle_letter(Letter::Command(CommandLetter::new(
                CommandKind::AcceptRst,
                "",
            )))
            .await;
        assert_eq!(unit.core().queue_len(), 0);
    }

    #[tokio::test]
    async fn test_maintainer_reports_pending_then_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = Channel::new(64);
        let reports = channel.take_receiver();
        let output = FakeOutput::new();
        let config = Arc::new(worker_config(dir.path()));
        let unit = JobProcUnit::new(
            config,
            FakeOutput::new(),
            "w1",
            channel.entry(JOB_UNIT_IDENT),
        );
        unit.core().set_state(UnitState::Ready);

        let maintainer = UnitMaintainer::new(vec![unit.clone()], output.clone(), "w1");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(maintainer.run(reports, cancel.clone()));

        // A dirty unit (with nothing to clean, so recovery succeeds)
        // parks the worker and then releases it.
        unit.core().set_state_notify(UnitState::Dirty).await;

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let states = output.wsc_states();
                if states == vec!["PENDING".to_string(), "READY".to_string()] {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("maintainer never recovered the unit");

        assert_eq!(unit.core().state(), UnitState::Ready);
        cancel.cancel();
        let _ = handle.await;
    }
}

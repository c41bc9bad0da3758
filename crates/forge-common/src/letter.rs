// Wire messages exchanged between master, workers and the merger.
// Text letters travel as a JSON envelope {"type", "header", "content"};
// binary letters use their own fixed-field framing (see codec.rs).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProtocolError;

/// Task state codes carried by Response letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCode {
    #[serde(rename = "0")]
    Prepare,
    #[serde(rename = "1")]
    InProc,
    #[serde(rename = "2")]
    Finished,
    #[serde(rename = "3")]
    Failure,
}

/// Role a worker declares in its Property letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "MERGER")]
    Merger,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Normal => write!(f, "NORMAL"),
            WorkerRole::Merger => write!(f, "MERGER"),
        }
    }
}

/// Command kinds the master sends through a Command letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Session accepted; the worker resumes without resetting local state.
    #[serde(rename = "ACCEPT")]
    Accept,
    /// Session accepted; the worker must discard all unit state first.
    #[serde(rename = "ACCEPT_RST")]
    AcceptRst,
    #[serde(rename = "CANCEL_JOB")]
    CancelJob,
}

/// Kind discriminator on a Cancel letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelKind {
    Single,
    Post,
}

/// Notify subtype for worker-state-change reports.
pub const NOTIFY_WSC: &str = "WSC";

/// WSC payload values.
pub const WSC_STATE_PENDING: &str = "PENDING";
pub const WSC_STATE_READY: &str = "READY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

// ---------------------------------------------------------------------------
// Letter bodies
// ---------------------------------------------------------------------------

/// First frame a worker sends after connecting: its identity and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyLetter {
    pub header: PropertyHeader,
    pub content: PropertyContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyHeader {
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyContent {
    #[serde(rename = "MAX")]
    pub max: u32,
    #[serde(rename = "PROC")]
    pub proc: u32,
    pub role: WorkerRole,
}

impl PropertyLetter {
    pub fn new(ident: impl Into<String>, max: u32, proc: u32, role: WorkerRole) -> Self {
        Self {
            header: PropertyHeader { ident: ident.into() },
            content: PropertyContent { max, proc, role },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatLetter {
    pub header: HeartbeatHeader,
    #[serde(default)]
    pub content: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatHeader {
    pub ident: String,
    pub seq: u64,
}

impl HeartbeatLetter {
    pub fn new(ident: impl Into<String>, seq: u64) -> Self {
        Self {
            header: HeartbeatHeader { ident: ident.into(), seq },
            content: Empty {},
        }
    }
}

/// Dispatch of a Single task to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskLetter {
    pub header: NewTaskHeader,
    pub content: NewTaskContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskHeader {
    pub tid: String,
    #[serde(default)]
    pub parent: String,
    #[serde(rename = "needPost")]
    pub need_post: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskContent {
    pub sn: String,
    pub vsn: String,
    pub datetime: String,
    pub extra: TaskExtra,
}

/// Build instructions carried inside a NewTask letter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskExtra {
    pub cmds: Vec<String>,
    #[serde(rename = "resultPath")]
    pub result_path: String,
    /// Post-ident the result belongs to, when the task feeds a merge.
    #[serde(default, rename = "PostTarget", skip_serializing_if = "Option::is_none")]
    pub post_target: Option<String>,
}

/// Task state report from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseLetter {
    pub header: ResponseHeader,
    pub content: ResponseContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub ident: String,
    pub tid: String,
    #[serde(default)]
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseContent {
    pub state: StateCode,
}

impl ResponseLetter {
    pub fn new(ident: impl Into<String>, tid: impl Into<String>, state: StateCode) -> Self {
        Self {
            header: ResponseHeader {
                ident: ident.into(),
                tid: tid.into(),
                parent: String::new(),
            },
            content: ResponseContent { state },
        }
    }
}

/// Dispatch of a Post (merge) task to the merger worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTaskLetter {
    pub header: PostTaskHeader,
    pub content: PostTaskContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTaskHeader {
    pub ident: String,
    pub version: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTaskContent {
    pub cmds: Vec<String>,
    #[serde(rename = "Fragments")]
    pub fragments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelLetter {
    pub header: CancelHeader,
    #[serde(default)]
    pub content: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelHeader {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: CancelKind,
}

impl CancelLetter {
    pub fn new(task_id: impl Into<String>, kind: CancelKind) -> Self {
        Self {
            header: CancelHeader { task_id: task_id.into(), kind },
            content: Empty {},
        }
    }
}

/// Control command from the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLetter {
    pub header: CommandHeader,
    #[serde(default)]
    pub content: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandHeader {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub extra: String,
}

impl CommandLetter {
    pub fn new(kind: CommandKind, target: impl Into<String>) -> Self {
        Self {
            header: CommandHeader {
                kind,
                target: target.into(),
                extra: String::new(),
            },
            content: BTreeMap::new(),
        }
    }
}

/// Worker acknowledgement of a Command letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdResponseLetter {
    pub header: CmdResponseHeader,
    pub content: CmdResponseContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdResponseHeader {
    pub ident: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub state: String,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdResponseContent {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

pub const CMD_RESPONSE_SUCCESS: &str = "s";
pub const CMD_RESPONSE_FAILED: &str = "f";

/// A worker-side log line destined for a registered log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLetter {
    pub header: LogHeader,
    pub content: LogContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHeader {
    pub ident: String,
    #[serde(rename = "logId")]
    pub log_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogContent {
    #[serde(rename = "logMsg")]
    pub log_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRegisterLetter {
    pub header: LogHeader,
    #[serde(default)]
    pub content: Empty,
}

/// Out-of-band notification from a worker; the `WSC` subtype reports
/// worker readiness (PENDING / READY).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyLetter {
    pub header: NotifyHeader,
    #[serde(default)]
    pub content: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyHeader {
    pub ident: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl NotifyLetter {
    /// Build a worker-state-change notification.
    pub fn wsc(ident: impl Into<String>, state: &str) -> Self {
        let mut content = BTreeMap::new();
        content.insert("state".to_string(), state.to_string());
        Self {
            header: NotifyHeader {
                ident: ident.into(),
                kind: NOTIFY_WSC.to_string(),
            },
            content,
        }
    }

    pub fn wsc_state(&self) -> Option<&str> {
        self.content.get("state").map(|s| s.as_str())
    }
}

/// Captured output of a running task, shipped over the UDP log channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogLetter {
    pub header: TaskLogHeader,
    pub content: TaskLogContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogHeader {
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogContent {
    pub message: String,
}

impl TaskLogLetter {
    pub fn new(tid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            header: TaskLogHeader { ident: tid.into() },
            content: TaskLogContent { message: message.into() },
        }
    }
}

// ---------------------------------------------------------------------------
// Binary letter
// ---------------------------------------------------------------------------

/// One chunk of an artifact stream. An empty payload marks end-of-stream
/// for the task's artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryLetter {
    pub tid: String,
    pub file_name: String,
    pub parent: String,
    pub menu: String,
    pub payload: Bytes,
}

impl BinaryLetter {
    pub const FILE_NAME_FIELD_LEN: usize = 32;
    pub const TASK_ID_FIELD_LEN: usize = 128;
    pub const PARENT_FIELD_LEN: usize = 64;
    pub const MENU_FIELD_LEN: usize = 30;

    pub fn new(
        tid: impl Into<String>,
        payload: Bytes,
        file_name: impl Into<String>,
        parent: impl Into<String>,
        menu: impl Into<String>,
    ) -> Self {
        Self {
            tid: tid.into(),
            file_name: file_name.into(),
            parent: parent.into(),
            menu: menu.into(),
            payload,
        }
    }

    /// End-of-stream marker for the given task's artifact.
    pub fn end_of_stream(
        tid: impl Into<String>,
        file_name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self::new(tid, Bytes::new(), file_name, parent, "")
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }
}

// ---------------------------------------------------------------------------
// The letter itself
// ---------------------------------------------------------------------------

/// Every message kind that can cross a Forge connection.
///
/// Text kinds serialize into the `{"type", "header", "content"}` envelope;
/// `Binary` never goes through serde and is handled by the codec directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Letter {
    #[serde(rename = "notify")]
    Property(PropertyLetter),
    #[serde(rename = "Hb")]
    Heartbeat(HeartbeatLetter),
    #[serde(rename = "new")]
    NewTask(NewTaskLetter),
    #[serde(rename = "response")]
    Response(ResponseLetter),
    #[serde(rename = "Post")]
    PostTask(PostTaskLetter),
    #[serde(rename = "cancel")]
    Cancel(CancelLetter),
    #[serde(rename = "command")]
    Command(CommandLetter),
    #[serde(rename = "cmdResponse")]
    CmdResponse(CmdResponseLetter),
    #[serde(rename = "log")]
    Log(LogLetter),
    #[serde(rename = "logRegister")]
    LogRegister(LogRegisterLetter),
    #[serde(rename = "Notify")]
    Notify(NotifyLetter),
    #[serde(rename = "TL")]
    TaskLog(TaskLogLetter),
    #[serde(skip)]
    Binary(BinaryLetter),
}

impl Letter {
    /// The wire type tag, used as the handler-registry key.
    pub fn type_name(&self) -> &'static str {
        match self {
            Letter::Property(_) => "notify",
            Letter::Heartbeat(_) => "Hb",
            Letter::NewTask(_) => "new",
            Letter::Response(_) => "response",
            Letter::PostTask(_) => "Post",
            Letter::Cancel(_) => "cancel",
            Letter::Command(_) => "command",
            Letter::CmdResponse(_) => "cmdResponse",
            Letter::Log(_) => "log",
            Letter::LogRegister(_) => "logRegister",
            Letter::Notify(_) => "Notify",
            Letter::TaskLog(_) => "TL",
            Letter::Binary(_) => "binary",
        }
    }

    /// Decode a text letter from its JSON envelope.
    pub fn from_json(raw: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(raw).map_err(|e| ProtocolError::UnexpectedType(e.to_string()))
    }

    /// Encode a text letter into its JSON envelope.
    ///
    /// Panics on `Binary`, which has no JSON form; the codec routes it to
    /// the binary framing before this is ever reached.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("text letter serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_round_trip() {
        let letter = Letter::NewTask(NewTaskLetter {
            header: NewTaskHeader {
                tid: "1_GL8900".into(),
                parent: String::new(),
                need_post: true,
            },
            content: NewTaskContent {
                sn: "sn_1".into(),
                vsn: "vsn_1".into(),
                datetime: "2020-01-01 00:00:00".into(),
                extra: TaskExtra {
                    cmds: vec!["make".into()],
                    result_path: "out/app.bin".into(),
                    post_target: Some("GL8900".into()),
                },
            },
        });

        let parsed = Letter::from_json(&letter.to_json()).unwrap();
        assert_eq!(letter, parsed);
    }

    #[test]
    fn test_response_state_codes() {
        let letter = Letter::Response(ResponseLetter::new("w1", "1_B1", StateCode::InProc));
        let raw = letter.to_json();
        let text = String::from_utf8(raw.clone()).unwrap();
        assert!(text.contains("\"state\":\"1\""), "state must be string-coded: {text}");
        assert_eq!(Letter::from_json(&raw).unwrap(), letter);
    }

    #[test]
    fn test_property_round_trip() {
        let letter = Letter::Property(PropertyLetter::new("w1", 4, 0, WorkerRole::Merger));
        let parsed = Letter::from_json(&letter.to_json()).unwrap();
        match parsed {
            Letter::Property(p) => {
                assert_eq!(p.header.ident, "w1");
                assert_eq!(p.content.max, 4);
                assert_eq!(p.content.role, WorkerRole::Merger);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_command_round_trip() {
        let letter = Letter::Command(CommandLetter::new(CommandKind::AcceptRst, ""));
        let parsed = Letter::from_json(&letter.to_json()).unwrap();
        assert_eq!(letter, parsed);
    }

    #[test]
    fn test_wsc_notify() {
        let letter = NotifyLetter::wsc("w1", WSC_STATE_PENDING);
        assert_eq!(letter.wsc_state(), Some("PENDING"));
        assert_eq!(letter.header.kind, NOTIFY_WSC);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Letter::from_json(br#"{"type":"nope","header":{},"content":{}}"#);
        assert!(err.is_err());
    }
}

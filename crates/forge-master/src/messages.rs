// Messages published to front-end clients: job lifecycle events, history
// and task output. Only the shape is fixed here; delivery (WebSocket or
// otherwise) belongs to the external proxy.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An envelope of `{"type": ..., "content": {"subtype": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// A stored build result as shown to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub unique_id: String,
    pub jobid: String,
    pub url: String,
}

impl ClientMessage {
    fn new(kind: &str, subtype: &str, message: Value) -> Self {
        Self {
            kind: kind.to_string(),
            content: json!({ "subtype": subtype, "message": message }),
        }
    }

    /// Snapshot of a job and its tasks, sent when the job enters processing.
    pub fn job_info(unique_id: &str, jobid: &str, tasks: &[(String, String)]) -> Self {
        let tasks: Vec<Value> = tasks
            .iter()
            .map(|(id, state)| json!([id, state]))
            .collect();
        Self::new(
            "job.msg",
            "info",
            json!({
                "unique_id": unique_id,
                "jobid": jobid,
                "tasks": tasks,
            }),
        )
    }

    pub fn job_state_change(unique_id: &str, jobid: &str, taskid: &str, state: &str) -> Self {
        Self::new(
            "job.msg",
            "change",
            json!({
                "unique_id": unique_id,
                "jobid": jobid,
                "taskid": taskid,
                "state": state,
            }),
        )
    }

    pub fn job_fin(unique_id: &str) -> Self {
        Self::new("job.msg", "fin", json!({ "jobs": [unique_id] }))
    }

    pub fn job_fail(unique_id: &str) -> Self {
        Self::new("job.msg", "fail", json!({ "jobs": [unique_id] }))
    }

    /// Batch wrapper; nested batches are flattened away by construction.
    pub fn batch(messages: Vec<ClientMessage>) -> Self {
        let inner: Vec<Value> = messages
            .into_iter()
            .filter(|m| m.kind != "job.msg.batch")
            .map(|m| json!({ "type": m.kind, "content": m.content }))
            .collect();
        Self {
            kind: "job.msg.batch".to_string(),
            content: json!({ "subtype": "batch", "message": inner }),
        }
    }

    /// One terminated job with its final task states.
    pub fn job_history(jobs: &[(String, String, Vec<(String, String)>)]) -> Self {
        let mut message = serde_json::Map::new();
        for (unique_id, jobid, tasks) in jobs {
            let task_map: Value = tasks
                .iter()
                .map(|(tid, state)| {
                    (
                        tid.clone(),
                        json!({ "taskid": tid, "state": state }),
                    )
                })
                .collect::<serde_json::Map<String, Value>>()
                .into();
            message.insert(
                unique_id.clone(),
                json!({
                    "unique_id": unique_id,
                    "jobid": jobid,
                    "tasks": task_map,
                }),
            );
        }
        Self::new("job.msg.history", "history", message.into())
    }

    pub fn job_new_result(result: &BuildResult) -> Self {
        Self::new(
            "job.msg.file.new",
            "new",
            json!({
                "unique_id": result.unique_id,
                "ver_id": result.jobid,
                "url": result.url,
            }),
        )
    }

    pub fn job_all_results(results: &[BuildResult]) -> Self {
        let message: serde_json::Map<String, Value> = results
            .iter()
            .map(|r| {
                (
                    r.unique_id.clone(),
                    json!({
                        "unique_id": r.unique_id,
                        "ver_id": r.jobid,
                        "url": r.url,
                    }),
                )
            })
            .collect();
        Self::new("job.msg.file.exists", "exists", message.into())
    }

    /// A slice of a task's persisted output.
    pub fn task_output(
        unique_id: &str,
        taskid: &str,
        pos: i64,
        message: &str,
        last: bool,
    ) -> Self {
        Self::new(
            "job.msg.task.output",
            "output",
            json!({
                "uid": unique_id,
                "task": taskid,
                "pos": pos,
                "len": message.len(),
                "msg": message,
                "last": if last { 1 } else { 0 },
            }),
        )
    }

    pub fn subtype(&self) -> Option<&str> {
        self.content.get("subtype").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_info_shape() {
        let msg = ClientMessage::job_info(
            "1",
            "J",
            &[("GL8900".into(), "PREPARE".into())],
        );
        assert_eq!(msg.kind, "job.msg");
        assert_eq!(msg.subtype(), Some("info"));
        assert_eq!(
            msg.content["message"]["tasks"][0],
            json!(["GL8900", "PREPARE"])
        );
    }

    #[test]
    fn test_batch_flattens_nested_batches() {
        let inner = ClientMessage::batch(vec![ClientMessage::job_fin("1")]);
        let msg = ClientMessage::batch(vec![inner, ClientMessage::job_fail("2")]);
        let items = msg.content["message"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "job.msg");
    }

    #[test]
    fn test_round_trip() {
        let msg = ClientMessage::job_state_change("1", "J", "GL8900", "IN_PROC");
        let raw = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, msg);
    }
}

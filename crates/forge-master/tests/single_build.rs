// End-to-end flow of a single-build job against a fully wired master:
// a scripted worker connects over TCP, takes the task, streams the
// artifact through the data link and reports completion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use forge_common::codec::LetterCodec;
use forge_common::config::MasterConfig;
use forge_common::letter::{
    BinaryLetter, CommandKind, HeartbeatLetter, Letter, PropertyLetter, ResponseLetter,
    StateCode, WorkerRole,
};
use forge_master::data_link;
use forge_master::dispatcher::Dispatcher;
use forge_master::event_router::EventRouter;
use forge_master::handlers::{
    BinaryIngest, LogHandler, LogRegisterHandler, ResponseHandler, TransferRegistry,
    WscNotifyHandler,
};
use forge_master::job::Job;
use forge_master::job_master::JobMaster;
use forge_master::log_sink::LogSink;
use forge_master::pdb::PersistentStore;
use forge_master::records::RecordStore;
use forge_master::storage::Storage;
use forge_master::tracker::TaskTracker;
use forge_master::worker_room::WorkerRoom;

struct MasterUnderTest {
    job_master: Arc<JobMaster>,
    records: Arc<RecordStore>,
    control_addr: std::net::SocketAddr,
    data_addr: std::net::SocketAddr,
    result_dir: std::path::PathBuf,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start_master() -> MasterUnderTest {
    let dir = tempfile::tempdir().unwrap();
    let result_dir = dir.path().join("results");

    let yaml = format!(
        r#"
Address: "127.0.0.1"
Port: 0
ResultDir: "{}"
LogDir: "{}"
WaitingInterval: 2
dataPort: 0
JOB_COMMAND_GL8900:
  cmd: ["echo ok > out"]
  output: "out"
"#,
        result_dir.display(),
        dir.path().join("logs").display(),
    );
    let config: Arc<MasterConfig> = Arc::new(serde_yaml::from_str(&yaml).unwrap());

    let records = RecordStore::open(&dir.path().join("records")).unwrap();
    let pdb = Arc::new(
        PersistentStore::open(dir.path().join("pdb"), records.clone())
            .await
            .unwrap(),
    );
    let storage = Arc::new(Storage::new(dir.path().join("storage")).unwrap());
    let log_sink = Arc::new(LogSink::new(dir.path().join("logs")).unwrap());
    let finished = TransferRegistry::new();

    let router = EventRouter::new();
    let room = WorkerRoom::new(Duration::from_secs(2), router.clone());
    let tracker = Arc::new(TaskTracker::new());

    let (notify_tx, notify_rx) = mpsc::channel(256);
    let dispatcher = Dispatcher::new(tracker.clone(), room.clone(), notify_tx);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(256);
    let job_master = JobMaster::new(config.clone(), records.clone(), pdb, dispatch_tx);

    let ingest = BinaryIngest::new(storage, finished.clone());
    router.register(
        "response",
        ResponseHandler::new(
            dispatcher.clone(),
            job_master.clone(),
            finished,
            result_dir.clone(),
        ),
    );
    router.register("log", LogHandler::new(log_sink.clone()));
    router.register("logRegister", LogRegisterHandler::new(log_sink));
    router.register("binary", ingest.clone());
    router.register("Notify", WscNotifyHandler::new(room.clone()));

    let cancel = CancellationToken::new();

    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control.local_addr().unwrap();
    tokio::spawn(room.clone().run_listener(control, cancel.clone()));
    tokio::spawn(room.clone().run_maintain(cancel.clone()));

    tokio::spawn(dispatcher.clone().run(cancel.clone()));
    tokio::spawn(dispatcher.clone().run_endpoint(dispatch_rx, cancel.clone()));
    tokio::spawn(
        dispatcher
            .clone()
            .run_room_events(room.subscribe(), cancel.clone()),
    );
    tokio::spawn(job_master.clone().run_notify(notify_rx, cancel.clone()));

    let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_addr = data.local_addr().unwrap();
    tokio::spawn(data_link::run_binary_listener(data, ingest, cancel.clone()));

    MasterUnderTest {
        job_master,
        records,
        control_addr,
        data_addr,
        result_dir,
        cancel,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_single_build_job_runs_to_completion() {
    let master = start_master().await;
    let mut messages = master.job_master.subscribe_messages();

    // A worker joins the fleet.
    let stream = TcpStream::connect(master.control_addr).await.unwrap();
    let mut worker = Framed::new(stream, LetterCodec::new());
    worker
        .send(Letter::Property(PropertyLetter::new(
            "W1",
            2,
            0,
            WorkerRole::Normal,
        )))
        .await
        .unwrap();
    worker
        .send(Letter::Heartbeat(HeartbeatLetter::new("W1", 0)))
        .await
        .unwrap();

    // The fresh session is told to reset before taking work.
    let mut got_accept = false;
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(5), worker.next())
            .await
            .expect("no accept command")
            .unwrap()
            .unwrap()
        {
            Letter::Command(cmd) => {
                assert_eq!(cmd.header.kind, CommandKind::AcceptRst);
                got_accept = true;
                break;
            }
            Letter::Heartbeat(_) => continue,
            other => panic!("unexpected letter {other:?}"),
        }
    }
    assert!(got_accept);

    // Submit the job.
    let mut info = BTreeMap::new();
    info.insert("sn".to_string(), "s1".to_string());
    info.insert("vsn".to_string(), "v1".to_string());
    master
        .job_master
        .do_job(Job::new("J", "GL8900", info))
        .await
        .unwrap();

    // The dispatcher hands the task to the worker.
    let new_task = loop {
        match tokio::time::timeout(Duration::from_secs(10), worker.next())
            .await
            .expect("task never dispatched")
            .unwrap()
            .unwrap()
        {
            Letter::NewTask(task) => break task,
            Letter::Heartbeat(_) | Letter::Command(_) => continue,
            other => panic!("unexpected letter {other:?}"),
        }
    };
    assert_eq!(new_task.header.tid, "1_GL8900");
    assert_eq!(new_task.content.sn, "s1");
    assert!(!new_task.header.need_post);

    worker
        .send(Letter::Response(ResponseLetter::new(
            "W1",
            "1_GL8900",
            StateCode::InProc,
        )))
        .await
        .unwrap();

    // Stream the artifact through the data link.
    {
        let data = TcpStream::connect(master.data_addr).await.unwrap();
        let mut frames = Framed::new(data, LetterCodec::new());
        frames
            .send(Letter::Binary(BinaryLetter::new(
                "1_GL8900",
                Bytes::from_static(b"ok\n"),
                "out",
                "v1",
                "",
            )))
            .await
            .unwrap();
        frames
            .send(Letter::Binary(BinaryLetter::end_of_stream("1_GL8900", "out", "v1")))
            .await
            .unwrap();
        frames.flush().await.unwrap();
    }
    // Let the ingest finish before declaring the task done.
    tokio::time::sleep(Duration::from_millis(300)).await;

    worker
        .send(Letter::Response(ResponseLetter::new(
            "W1",
            "1_GL8900",
            StateCode::Finished,
        )))
        .await
        .unwrap();

    // The client feed runs info -> change(IN_PROC) -> change(FIN) -> fin
    // -> history -> new result.
    let mut subtypes = Vec::new();
    while let Ok(Ok(msg)) =
        tokio::time::timeout(Duration::from_secs(5), messages.recv()).await
    {
        subtypes.push(msg.subtype().unwrap_or_default().to_string());
        if subtypes.last().map(|s| s == "new").unwrap_or(false) {
            break;
        }
    }
    assert_eq!(
        subtypes,
        vec!["info", "change", "change", "fin", "history", "new"]
    );

    // One history row, and the artifact landed under the result dir.
    let history = master.records.histories().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].unique_id, 1);
    assert_eq!(history[0].job, "J");
    let stored = master.result_dir.join("1").join("out");
    assert!(stored.exists());
    assert_eq!(history[0].file_path, stored.display().to_string());
    assert_eq!(std::fs::read(stored).unwrap(), b"ok\n");
    assert_eq!(history[0].tasks.len(), 1);
    assert_eq!(history[0].tasks[0].task_name, "GL8900");
    assert_eq!(history[0].tasks[0].state, "FIN");

    master.cancel.cancel();
}

/// A disconnected worker keeps its record through the grace window; a
/// second worker picks up the redispatched task after expiry.
#[tokio::test]
async fn test_worker_loss_redispatches_single_task() {
    let master = start_master().await;

    // First worker takes the task.
    let stream = TcpStream::connect(master.control_addr).await.unwrap();
    let mut w1 = Framed::new(stream, LetterCodec::new());
    w1.send(Letter::Property(PropertyLetter::new("W1", 2, 0, WorkerRole::Normal)))
        .await
        .unwrap();
    w1.send(Letter::Heartbeat(HeartbeatLetter::new("W1", 0)))
        .await
        .unwrap();

    let mut info = BTreeMap::new();
    info.insert("sn".to_string(), "s1".to_string());
    info.insert("vsn".to_string(), "v1".to_string());
    master
        .job_master
        .do_job(Job::new("J", "GL8900", info))
        .await
        .unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(10), w1.next())
            .await
            .expect("task never dispatched")
            .unwrap()
            .unwrap()
        {
            Letter::NewTask(task) => {
                assert_eq!(task.header.tid, "1_GL8900");
                break;
            }
            _ => continue,
        }
    }
    w1.send(Letter::Response(ResponseLetter::new("W1", "1_GL8900", StateCode::InProc)))
        .await
        .unwrap();

    // Kill the connection; the grace window (2 s) runs out and the task
    // must come back to a surviving worker.
    drop(w1);

    let stream = TcpStream::connect(master.control_addr).await.unwrap();
    let mut w2 = Framed::new(stream, LetterCodec::new());
    w2.send(Letter::Property(PropertyLetter::new("W2", 2, 0, WorkerRole::Normal)))
        .await
        .unwrap();
    w2.send(Letter::Heartbeat(HeartbeatLetter::new("W2", 0)))
        .await
        .unwrap();

    let redispatched = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match w2.next().await.unwrap().unwrap() {
                Letter::NewTask(task) => break task,
                _ => continue,
            }
        }
    })
    .await
    .expect("task was never redispatched");
    assert_eq!(redispatched.header.tid, "1_GL8900");

    master.cancel.cancel();
}

use crate::convert::{invoke, resolve_candidates, ConvertJob, ShapefileConverter};
use crate::logs::{prune_logs, ConversionLog};
use crate::paths::AppPaths;
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, ConversionRequest,
    ConversionResponse, OutputArtifact, NO_SHP_FILES_MESSAGE,
};
use crate::storage::{IntermediateFiles, StorageArea, StoredFile, OUTPUT_NAME};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    AwaitingRequest,
    ResolvingTarget,
    AwaitingSelection,
    Converting,
    Closed,
}

impl ProtocolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolState::AwaitingRequest => "awaiting_request",
            ProtocolState::ResolvingTarget => "resolving_target",
            ProtocolState::AwaitingSelection => "awaiting_selection",
            ProtocolState::Converting => "converting",
            ProtocolState::Closed => "closed",
        }
    }
}

/// States visited while handling one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traversal {
    pub request_id: String,
    pub states: Vec<ProtocolState>,
}

impl Traversal {
    fn start() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            states: vec![ProtocolState::AwaitingRequest],
        }
    }

    fn enter(&mut self, state: ProtocolState) {
        self.states.push(state);
    }

    pub fn last(&self) -> Option<ProtocolState> {
        self.states.last().copied()
    }
}

/// Handles one request at a time against a storage area it has to itself.
pub struct ConversionWorker<C> {
    storage: StorageArea,
    converter: C,
    log: ConversionLog,
    last_traversal: Option<Traversal>,
}

impl<C: ShapefileConverter> ConversionWorker<C> {
    pub fn new(storage: StorageArea, converter: C, log: ConversionLog) -> Self {
        Self {
            storage,
            converter,
            log,
            last_traversal: None,
        }
    }

    /// Worker rooted in the app directories. Old logs are pruned in the
    /// background.
    pub fn from_paths(paths: &AppPaths, converter: C) -> Result<Self> {
        paths.ensure_dirs()?;
        let storage = StorageArea::open(paths.storage_dir())?;

        let prune_paths = paths.clone();
        thread::spawn(move || {
            let _ = prune_logs(&prune_paths);
        });

        Ok(Self::new(storage, converter, ConversionLog::new(paths)))
    }

    pub fn storage(&self) -> &StorageArea {
        &self.storage
    }

    pub fn last_traversal(&self) -> Option<&Traversal> {
        self.last_traversal.as_ref()
    }

    /// Runs one request through the state machine. Every handle acquired on
    /// the way is released before this returns.
    pub fn handle(&mut self, request: &ConversionRequest) -> ConversionResponse {
        let mut traversal = Traversal::start();
        let _ = self.log.line(
            &traversal.request_id,
            "info",
            "request_received",
            serde_json::json!({
                "archive": request.archive.name,
                "output_format": request.output_format.as_str(),
                "target": request.explicit_target(),
                "options": request.options,
            }),
        );

        let response = self.run(request, &mut traversal);
        if traversal.last() != Some(ProtocolState::AwaitingSelection) {
            traversal.enter(ProtocolState::Closed);
        }

        let (level, detail) = match &response {
            ConversionResponse::Failure { message } => ("error", serde_json::json!(message)),
            ConversionResponse::NeedsSelection { candidates } => {
                ("info", serde_json::json!(candidates))
            }
            ConversionResponse::Success { output } => ("info", serde_json::json!(output)),
            ConversionResponse::Ready => ("info", serde_json::Value::Null),
        };
        let _ = self.log.line(
            &traversal.request_id,
            level,
            "response_emitted",
            serde_json::json!({
                "kind": response.kind(),
                "detail": detail,
                "states": traversal.states,
            }),
        );

        self.last_traversal = Some(traversal);
        response
    }

    fn run(&mut self, request: &ConversionRequest, traversal: &mut Traversal) -> ConversionResponse {
        let target = match request.explicit_target() {
            Some(target) => target.to_string(),
            None => {
                traversal.enter(ProtocolState::ResolvingTarget);
                let mut candidates = match resolve_candidates(&self.converter, &request.archive)
                {
                    Ok(v) => v,
                    Err(fault) => return ConversionResponse::failure(fault.user_message()),
                };
                match candidates.len() {
                    0 => return ConversionResponse::failure(NO_SHP_FILES_MESSAGE),
                    1 => candidates.remove(0),
                    _ => {
                        traversal.enter(ProtocolState::AwaitingSelection);
                        return ConversionResponse::NeedsSelection { candidates };
                    }
                }
            }
        };

        traversal.enter(ProtocolState::Converting);
        self.convert(request, &target, &traversal.request_id)
    }

    fn convert(
        &mut self,
        request: &ConversionRequest,
        target: &str,
        request_id: &str,
    ) -> ConversionResponse {
        let mut output = match self.storage.acquire(OUTPUT_NAME) {
            Ok(v) => v,
            Err(e) => return ConversionResponse::failure(e.to_string()),
        };
        let mut intermediates = match IntermediateFiles::acquire(&self.storage) {
            Ok(v) => v,
            Err(e) => {
                let _ = output.release();
                return ConversionResponse::failure(e.to_string());
            }
        };

        let converted = invoke(
            &mut self.converter,
            ConvertJob {
                archive: &request.archive,
                target,
                intermediates: &mut intermediates,
                output: &mut output,
                format: request.output_format,
                options: &request.options,
            },
        );

        // Both sides are released even if the first one fails.
        let released = intermediates.release().and(output.release());

        match (converted, released) {
            (Ok(filename), Ok(())) => {
                let handle = StoredFile::new(OUTPUT_NAME);
                let _ = match self.storage.sha256_hex(&handle) {
                    Ok(sha256) => self.log.line(
                        request_id,
                        "info",
                        "artifact_written",
                        serde_json::json!({ "filename": filename, "sha256": sha256 }),
                    ),
                    Err(e) => self.log.line(
                        request_id,
                        "warn",
                        "artifact_digest_failed",
                        serde_json::json!({ "filename": filename, "error": e.to_string() }),
                    ),
                };
                ConversionResponse::Success {
                    output: OutputArtifact { handle, filename },
                }
            }
            (Ok(_), Err(e)) => ConversionResponse::failure(e.to_string()),
            (Err(fault), _) => ConversionResponse::failure(fault.user_message()),
        }
    }
}

/// Starts the worker on its own thread. It announces itself with a `Ready`
/// message before reading any request.
pub fn spawn_worker<C>(worker: ConversionWorker<C>) -> Result<PendingWorker>
where
    C: ShapefileConverter + Send + 'static,
{
    let (request_tx, request_rx) = mpsc::channel::<String>();
    let (response_tx, response_rx) = mpsc::channel::<String>();

    thread::Builder::new()
        .name("shp2gp-worker".to_string())
        .spawn(move || serve(worker, request_rx, response_tx))?;

    Ok(connect(request_tx, response_rx))
}

fn serve<C: ShapefileConverter>(
    mut worker: ConversionWorker<C>,
    requests: Receiver<String>,
    responses: Sender<String>,
) {
    let Ok(ready) = encode_response(&ConversionResponse::Ready) else {
        return;
    };
    if responses.send(ready).is_err() {
        return;
    }

    for raw in requests.iter() {
        let response = match decode_request(&raw) {
            Ok(request) => worker.handle(&request),
            Err(e) => ConversionResponse::failure(format!("invalid request: {e}")),
        };
        let encoded = match encode_response(&response) {
            Ok(v) => v,
            Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
        };
        if responses.send(encoded).is_err() {
            break;
        }
    }
}

/// Wraps a raw message channel pair. The other end must send `Ready` first.
pub fn connect(requests: Sender<String>, responses: Receiver<String>) -> PendingWorker {
    PendingWorker {
        requests,
        responses,
        ready: false,
    }
}

/// A worker that has not yet been seen to be ready. Requests can only be sent
/// through the [`WorkerClient`] obtained once it is.
#[derive(Debug)]
pub struct PendingWorker {
    requests: Sender<String>,
    responses: Receiver<String>,
    ready: bool,
}

impl PendingWorker {
    /// Waits up to `timeout` for the ready message. `Ok(false)` means it has
    /// not arrived yet.
    pub fn poll_ready(&mut self, timeout: Duration) -> Result<bool> {
        if self.ready {
            return Ok(true);
        }
        match self.responses.recv_timeout(timeout) {
            Ok(raw) => match decode_response(&raw)? {
                ConversionResponse::Ready => {
                    self.ready = true;
                    Ok(true)
                }
                other => Err(EngineError::UnexpectedResponseShape(format!(
                    "expected ready before any request, got {}",
                    other.kind()
                ))),
            },
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::WorkerUnavailable(
                "worker exited before signalling ready".to_string(),
            )),
        }
    }

    pub fn into_client(self) -> Result<WorkerClient> {
        if !self.ready {
            return Err(EngineError::NotReady);
        }
        Ok(WorkerClient {
            requests: self.requests,
            responses: self.responses,
        })
    }

    pub fn wait_ready(mut self, timeout: Duration) -> Result<WorkerClient> {
        if !self.poll_ready(timeout)? {
            return Err(EngineError::NotReady);
        }
        self.into_client()
    }
}

#[derive(Debug)]
pub struct WorkerClient {
    requests: Sender<String>,
    responses: Receiver<String>,
}

impl WorkerClient {
    pub fn send(&self, request: &ConversionRequest) -> Result<()> {
        self.send_raw(encode_request(request)?)
    }

    pub fn send_raw(&self, raw: String) -> Result<()> {
        self.requests
            .send(raw)
            .map_err(|_| EngineError::WorkerUnavailable("request channel closed".to_string()))
    }

    pub fn recv(&self) -> Result<ConversionResponse> {
        let raw = self
            .responses
            .recv()
            .map_err(|_| EngineError::WorkerUnavailable("response channel closed".to_string()))?;
        decode_response(&raw)
    }

    /// One request, one response.
    pub fn request(&self, request: &ConversionRequest) -> Result<ConversionResponse> {
        self.send(request)?;
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::convert::{ConversionFault, OutputFormat};
    use crate::storage::{ATTRIBUTES_NAME, GEOMETRY_NAME};
    use std::io::Write;
    use std::path::Path;
    use zip::write::FileOptions;

    struct EchoConverter;

    impl ShapefileConverter for EchoConverter {
        fn convert(&mut self, job: ConvertJob<'_>) -> std::result::Result<(), ConversionFault> {
            job.output.write_all(job.target.as_bytes())?;
            Ok(())
        }
    }

    fn write_zip(dir: &Path, name: &str, entries: &[&str]) -> Archive {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create zip");
        let mut zip = zip::ZipWriter::new(file);
        for entry in entries {
            zip.start_file(*entry, FileOptions::default()).expect("start file");
            zip.write_all(b"x").expect("write entry");
        }
        zip.finish().expect("finish zip");
        Archive::from_path(&path)
    }

    fn worker(dir: &Path) -> ConversionWorker<EchoConverter> {
        let storage = StorageArea::open(dir.join("storage")).expect("storage");
        ConversionWorker::new(storage, EchoConverter, ConversionLog::at(dir.join("log.jsonl")))
    }

    #[test]
    fn traversal_states_follow_the_request_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let single = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let multi = write_zip(dir.path(), "multi.zip", &["a.shp", "b.shp"]);
        let empty = write_zip(dir.path(), "empty.zip", &["readme.txt"]);
        let mut worker = worker(dir.path());

        use ProtocolState::*;
        let cases = vec![
            (
                ConversionRequest::new(single, OutputFormat::GeoJson),
                vec![AwaitingRequest, ResolvingTarget, Converting, Closed],
            ),
            (
                ConversionRequest::new(multi.clone(), OutputFormat::GeoJson),
                vec![AwaitingRequest, ResolvingTarget, AwaitingSelection],
            ),
            (
                ConversionRequest::new(multi, OutputFormat::GeoJson).with_target("b.shp"),
                vec![AwaitingRequest, Converting, Closed],
            ),
            (
                ConversionRequest::new(empty, OutputFormat::GeoJson),
                vec![AwaitingRequest, ResolvingTarget, Closed],
            ),
        ];

        for (request, expected) in cases {
            worker.handle(&request);
            let traversal = worker.last_traversal().expect("traversal");
            assert_eq!(traversal.states, expected);
        }
        assert!(worker.storage().stats().is_balanced());
    }

    #[test]
    fn busy_output_becomes_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let mut worker = worker(dir.path());

        let held = worker.storage().acquire(OUTPUT_NAME).expect("hold output");
        let response = worker.handle(&ConversionRequest::new(archive, OutputFormat::GeoParquet));
        match response {
            ConversionResponse::Failure { message } => assert!(message.contains(OUTPUT_NAME)),
            other => panic!("expected failure, got {other:?}"),
        }
        held.release().expect("release");
        assert!(worker.storage().stats().is_balanced());
    }

    #[test]
    fn busy_intermediate_releases_the_output_it_already_took() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let mut worker = worker(dir.path());

        let held = worker.storage().acquire(ATTRIBUTES_NAME).expect("hold attributes");
        let response = worker.handle(&ConversionRequest::new(archive, OutputFormat::GeoParquet));
        match response {
            ConversionResponse::Failure { message } => {
                assert!(message.contains(ATTRIBUTES_NAME), "{message}")
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let stats = worker.storage().stats();
        assert!(!worker.storage().is_open(OUTPUT_NAME));
        assert!(!worker.storage().is_open(GEOMETRY_NAME));
        assert_eq!(stats.open, vec![ATTRIBUTES_NAME.to_string()]);
        assert_eq!(stats.acquired.get(OUTPUT_NAME), Some(&1));
        assert_eq!(stats.released.get(OUTPUT_NAME), Some(&1));
        assert_eq!(stats.acquired.get(GEOMETRY_NAME), stats.released.get(GEOMETRY_NAME));

        held.release().expect("release");
        assert!(worker.storage().stats().is_balanced());
    }

    /// Removes the output file from under its open handle.
    #[cfg(unix)]
    struct UnlinkingConverter {
        root: std::path::PathBuf,
    }

    #[cfg(unix)]
    impl ShapefileConverter for UnlinkingConverter {
        fn convert(&mut self, job: ConvertJob<'_>) -> std::result::Result<(), ConversionFault> {
            job.output.write_all(b"gone")?;
            std::fs::remove_file(self.root.join(OUTPUT_NAME))?;
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_digest_is_logged_as_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let storage = StorageArea::open(dir.path().join("storage")).expect("storage");
        let converter = UnlinkingConverter {
            root: storage.root().to_path_buf(),
        };
        let mut worker =
            ConversionWorker::new(storage, converter, ConversionLog::at(dir.path().join("log.jsonl")));

        let response = worker.handle(&ConversionRequest::new(archive, OutputFormat::GeoJson));
        assert_eq!(response.kind(), "success");

        let raw = std::fs::read_to_string(dir.path().join("log.jsonl")).expect("read log");
        let events: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        let warning = events
            .iter()
            .find(|e| e["event"] == "artifact_digest_failed")
            .expect("warning event");
        assert_eq!(warning["level"], "warn");
        assert_eq!(warning["data"]["filename"], "a.geojson");
        assert!(warning["data"]["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert!(events.iter().all(|e| e["event"] != "artifact_written"));
    }

    #[test]
    fn log_records_request_and_response() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let mut worker = worker(dir.path());
        worker.handle(&ConversionRequest::new(archive, OutputFormat::GeoJson));

        let raw = std::fs::read_to_string(dir.path().join("log.jsonl")).expect("read log");
        let events: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        let names: Vec<&str> = events
            .iter()
            .map(|e| e["event"].as_str().expect("event"))
            .collect();
        assert_eq!(
            names,
            vec!["request_received", "artifact_written", "response_emitted"]
        );
        let request_id = worker.last_traversal().expect("traversal").request_id.clone();
        assert!(events.iter().all(|e| e["request_id"] == request_id.as_str()));
        assert_eq!(events[1]["data"]["sha256"].as_str().map(str::len), Some(64));
        assert_eq!(events[2]["data"]["kind"], "success");
    }

    #[test]
    fn spawned_worker_signals_ready_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = write_zip(dir.path(), "single.zip", &["a.shp"]);
        let pending = spawn_worker(worker(dir.path())).expect("spawn");
        let client = pending.wait_ready(Duration::from_secs(5)).expect("ready");

        let response = client
            .request(&ConversionRequest::new(archive, OutputFormat::GeoJson))
            .expect("round trip");
        assert_eq!(response.kind(), "success");

        client.send_raw("{ nope".to_string()).expect("send");
        match client.recv().expect("recv") {
            ConversionResponse::Failure { message } => {
                assert!(message.starts_with("invalid request:"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn pending_worker_rejects_early_or_missing_ready() {
        let (request_tx, _request_rx) = mpsc::channel::<String>();
        let (response_tx, response_rx) = mpsc::channel::<String>();
        let mut pending = connect(request_tx, response_rx);
        assert!(!pending.poll_ready(Duration::from_millis(10)).expect("poll"));

        response_tx
            .send(r#"{"error":"too early"}"#.to_string())
            .expect("send");
        assert!(matches!(
            pending.poll_ready(Duration::from_millis(10)),
            Err(EngineError::UnexpectedResponseShape(_))
        ));

        drop(response_tx);
        assert!(matches!(
            pending.wait_ready(Duration::from_millis(10)),
            Err(EngineError::WorkerUnavailable(_))
        ));
    }
}

use crate::archive::{is_zip_archive, Archive};
use crate::config::ConversionSettings;
use crate::convert::OutputFormat;
use crate::paths::AppPaths;
use crate::protocol::{ConversionRequest, ConversionResponse, OutputArtifact};
use crate::storage::StorageArea;
use crate::worker::{PendingWorker, WorkerClient};
use crate::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const NOT_A_ZIP_MESSAGE: &str = "Please select a ZIP file";

/// What the UI shows: inputs are enabled only when ready and not busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UiStatus {
    pub ready: bool,
    pub busy: bool,
}

impl UiStatus {
    pub fn can_submit(&self) -> bool {
        self.ready && !self.busy
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<UiStatus>>,
}

impl StatusStore {
    pub fn get(&self) -> UiStatus {
        *self.lock()
    }

    pub fn set(&self, status: UiStatus) {
        *self.lock() = status;
    }

    fn lock(&self) -> MutexGuard<'_, UiStatus> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Downloaded { filename: String, path: PathBuf },
    SelectionRequired { candidates: Vec<String> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short-lived in-memory URLs for finished artifacts.
#[derive(Debug, Clone, Default)]
pub struct ObjectUrls {
    entries: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
}

impl ObjectUrls {
    pub fn create(&self, bytes: Vec<u8>) -> ObjectUrl {
        let url = format!("blob:{}", uuid::Uuid::new_v4());
        self.lock().insert(url.clone(), Arc::new(bytes));
        ObjectUrl(url)
    }

    pub fn resolve(&self, url: &ObjectUrl) -> Result<Arc<Vec<u8>>> {
        self.lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| EngineError::ObjectUrlRevoked(url.as_str().to_string()))
    }

    /// Returns false if the URL was already gone.
    pub fn revoke(&self, url: &ObjectUrl) -> bool {
        self.lock().remove(url.as_str()).is_some()
    }

    pub fn revoke_after(&self, url: ObjectUrl, delay: Duration) -> JoinHandle<()> {
        let urls = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            urls.revoke(&url);
        })
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Where finished artifacts end up, the equivalent of a browser download.
pub trait DownloadSink {
    fn deliver(&mut self, urls: &ObjectUrls, url: &ObjectUrl, filename: &str) -> Result<PathBuf>;
}

/// Writes artifacts into a directory, replacing files of the same name.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    dir: PathBuf,
}

impl DownloadDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn from_paths(paths: &AppPaths) -> Result<Self> {
        Ok(Self::new(paths.effective_download_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DownloadSink for DownloadDir {
    fn deliver(&mut self, urls: &ObjectUrls, url: &ObjectUrl, filename: &str) -> Result<PathBuf> {
        let bytes = urls.resolve(url)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(sanitize_filename(filename));
        std::fs::write(&path, bytes.as_slice())?;
        Ok(path)
    }
}

fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
struct PendingSelection {
    archive: Archive,
    format: OutputFormat,
    candidates: Vec<String>,
}

enum WorkerLink {
    Pending(PendingWorker),
    Ready(WorkerClient),
    Lost,
}

/// UI-side half of the protocol: one request in flight at a time, every
/// response shape handled.
pub struct Dispatcher<S> {
    link: WorkerLink,
    storage: StorageArea,
    sink: S,
    settings: ConversionSettings,
    status: StatusStore,
    urls: ObjectUrls,
    pending: Option<PendingSelection>,
    revocations: Vec<JoinHandle<()>>,
}

impl<S: DownloadSink> Dispatcher<S> {
    /// `storage` must be the area the worker writes its output into.
    pub fn new(
        worker: PendingWorker,
        storage: StorageArea,
        sink: S,
        settings: ConversionSettings,
    ) -> Self {
        Self {
            link: WorkerLink::Pending(worker),
            storage,
            sink,
            settings,
            status: StatusStore::default(),
            urls: ObjectUrls::default(),
            pending: None,
            revocations: Vec::new(),
        }
    }

    pub fn status(&self) -> UiStatus {
        self.status.get()
    }

    pub fn status_store(&self) -> StatusStore {
        self.status.clone()
    }

    pub fn object_urls(&self) -> &ObjectUrls {
        &self.urls
    }

    pub fn settings(&self) -> &ConversionSettings {
        &self.settings
    }

    pub fn pending_candidates(&self) -> Option<&[String]> {
        self.pending.as_ref().map(|p| p.candidates.as_slice())
    }

    /// Waits up to `timeout` for the worker to come up. Returns whether it is
    /// ready.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        match &mut self.link {
            WorkerLink::Ready(_) => return Ok(true),
            WorkerLink::Lost => {
                return Err(EngineError::WorkerUnavailable(
                    "worker link was lost".to_string(),
                ))
            }
            WorkerLink::Pending(pending) => match pending.poll_ready(timeout) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    self.link = WorkerLink::Lost;
                    return Err(e);
                }
            },
        }
        if let WorkerLink::Pending(pending) = std::mem::replace(&mut self.link, WorkerLink::Lost) {
            self.link = WorkerLink::Ready(pending.into_client()?);
        }
        self.status.set(UiStatus {
            ready: true,
            busy: false,
        });
        Ok(true)
    }

    /// Submits a freshly picked archive. A new submission drops any pending
    /// dataset selection.
    pub fn submit(&mut self, archive: Archive, format: OutputFormat) -> Result<DispatchOutcome> {
        if !is_zip_archive(&archive) {
            return Ok(DispatchOutcome::Failed {
                message: NOT_A_ZIP_MESSAGE.to_string(),
            });
        }
        self.check_can_send()?;
        self.pending = None;
        let request =
            ConversionRequest::new(archive, format).with_options(self.settings.options.clone());
        self.dispatch(request)
    }

    /// Converts one of the datasets offered by the last `SelectionRequired`.
    pub fn choose(&mut self, target: &str) -> Result<DispatchOutcome> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(EngineError::NoPendingSelection);
        };
        if !pending.candidates.iter().any(|c| c == target) {
            return Err(EngineError::UnknownCandidate {
                target: target.to_string(),
            });
        }
        self.check_can_send()?;

        let Some(pending) = self.pending.take() else {
            return Err(EngineError::NoPendingSelection);
        };
        let request = ConversionRequest::new(pending.archive, pending.format)
            .with_target(target)
            .with_options(self.settings.options.clone());
        self.dispatch(request)
    }

    /// Returns true if a selection was pending.
    pub fn cancel_selection(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Joins outstanding download-link revocations.
    pub fn flush_revocations(&mut self) {
        for handle in self.revocations.drain(..) {
            let _ = handle.join();
        }
    }

    fn check_can_send(&mut self) -> Result<()> {
        if !self.wait_ready(Duration::ZERO)? {
            return Err(EngineError::NotReady);
        }
        if self.status.get().busy {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    fn dispatch(&mut self, request: ConversionRequest) -> Result<DispatchOutcome> {
        let before = self.status.get();
        self.status.set(UiStatus {
            ready: before.ready,
            busy: true,
        });

        let response = match &self.link {
            WorkerLink::Ready(client) => client.request(&request),
            _ => Err(EngineError::NotReady),
        };
        let outcome = match response {
            Ok(response) => Ok(self.interpret(request, response)),
            Err(EngineError::UnexpectedResponseShape(detail)) => Ok(DispatchOutcome::Failed {
                message: EngineError::UnexpectedResponseShape(detail).to_string(),
            }),
            Err(e) => Err(e),
        };

        self.status.set(before);
        outcome
    }

    fn interpret(
        &mut self,
        request: ConversionRequest,
        response: ConversionResponse,
    ) -> DispatchOutcome {
        match response {
            ConversionResponse::Success { output } => self.deliver(output),
            ConversionResponse::NeedsSelection { candidates } => {
                if request.explicit_target().is_some() {
                    return unexpected("candidates offered for a request with a target");
                }
                self.pending = Some(PendingSelection {
                    archive: request.archive,
                    format: request.output_format,
                    candidates: candidates.clone(),
                });
                DispatchOutcome::SelectionRequired { candidates }
            }
            ConversionResponse::Failure { message } => DispatchOutcome::Failed { message },
            ConversionResponse::Ready => unexpected("ready received while a request was in flight"),
        }
    }

    /// Hands the artifact to the sink through an object URL that is revoked
    /// after the configured delay whether or not delivery worked.
    fn deliver(&mut self, output: OutputArtifact) -> DispatchOutcome {
        let bytes = match self.storage.read_bytes(&output.handle) {
            Ok(v) => v,
            Err(e) => {
                return DispatchOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        let _ = self.storage.discard(&output.handle);

        let url = self.urls.create(bytes);
        let delivered = self.sink.deliver(&self.urls, &url, &output.filename);

        self.revocations.retain(|h| !h.is_finished());
        self.revocations
            .push(self.urls.revoke_after(url, self.settings.revoke_delay()));

        match delivered {
            Ok(path) => DispatchOutcome::Downloaded {
                filename: output.filename,
                path,
            },
            Err(e) => DispatchOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

fn unexpected(detail: &str) -> DispatchOutcome {
    DispatchOutcome::Failed {
        message: EngineError::UnexpectedResponseShape(detail.to_string()).to_string(),
    }
}

//! Engine functions callable by the application.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::protocol::{EngineRequest, EngineResponse, LogLevel, MESSAGE_TYPE_ENGINE_REQUEST};
use super::queue::{ActionQueue, EngineAction, EngineActivity};
use crate::BoxFuture;
use crate::condition;
use crate::hresult::HResult;
use crate::model::{BundleModel, DownloadSource};
use crate::pipe::{PipeMessage, RpcService};
use crate::variables::{self, SharedVariables, VariableError, Variables};
use crate::version::Version;

/// Exit code used when the application disappears mid-session.
pub const APPLICATION_LOST_EXIT_CODE: u32 = 1603;

/// A source change the engine applies to its model before the next action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChange {
    Update(String),
    Payload { key: String, source: DownloadSource },
    Container { id: String, source: DownloadSource },
}

/// Source changes requested since the last action started.
pub type PendingSources = Arc<Mutex<Vec<SourceChange>>>;

/// Apply and clear `pending`.
pub fn apply_source_changes(pending: &PendingSources, model: &mut BundleModel) {
    let changes = std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner));
    for change in changes {
        match change {
            SourceChange::Update(url) => model.update.source = Some(url),
            SourceChange::Payload { key, source } => {
                if let Some(payload) = model.payloads.iter_mut().find(|p| p.key == key) {
                    payload.download = Some(source);
                }
            }
            SourceChange::Container { id, source } => {
                if let Some(container) = model.containers.iter_mut().find(|c| c.id == id) {
                    container.download = Some(source);
                }
            }
        }
    }
}

/// Ids a source change may name.
#[derive(Debug, Default, Clone)]
struct SourceIndex {
    packages: BTreeSet<String>,
    containers: BTreeSet<String>,
    payloads: BTreeSet<String>,
}

impl SourceIndex {
    fn from_model(model: &BundleModel) -> Self {
        Self {
            packages: model.packages.iter().map(|p| p.id.clone()).collect(),
            containers: model.containers.iter().map(|c| c.id.clone()).collect(),
            payloads: model.payloads.iter().map(|p| p.key.clone()).collect(),
        }
    }

    fn resolve(
        &self,
        id: &str,
        payload_key: Option<String>,
        source: DownloadSource,
    ) -> Result<SourceChange, HResult> {
        if !self.packages.contains(id) && !self.containers.contains(id) {
            return Err(HResult::NOT_FOUND);
        }
        match payload_key {
            Some(key) if self.payloads.contains(&key) => Ok(SourceChange::Payload { key, source }),
            Some(_) => Err(HResult::NOT_FOUND),
            None if self.containers.contains(id) => Ok(SourceChange::Container {
                id: id.to_string(),
                source,
            }),
            None => Err(HResult::E_INVALIDARG),
        }
    }
}

/// Answers [`EngineRequest`]s. Cheap to clone; every clone shares state.
#[derive(Clone)]
pub struct EngineApi {
    queue: Arc<ActionQueue>,
    activity: Arc<EngineActivity>,
    variables: SharedVariables,
    sources: PendingSources,
    index: Arc<SourceIndex>,
}

impl std::fmt::Debug for EngineApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineApi")
            .field("queued", &self.queue.len())
            .field("active", &self.activity.is_active())
            .finish_non_exhaustive()
    }
}

fn var_err(e: VariableError) -> HResult {
    e.hresult()
}

impl EngineApi {
    pub fn new(
        model: &BundleModel,
        queue: Arc<ActionQueue>,
        activity: Arc<EngineActivity>,
        variables: SharedVariables,
        sources: PendingSources,
    ) -> Self {
        Self {
            queue,
            activity,
            variables,
            sources,
            index: Arc::new(SourceIndex::from_model(model)),
        }
    }

    /// The application's request pipe closed. Unless the engine is already
    /// quitting, queue a failing quit so the engine loop does not wait on an
    /// application that is gone.
    pub fn peer_disconnected(&self) {
        if !self.queue.is_quitting() {
            warn!("Application disconnected without quitting");
            let _ = self.queue.enqueue(EngineAction::Quit(APPLICATION_LOST_EXIT_CODE));
        }
    }

    fn with_variables<T>(
        &self,
        f: impl FnOnce(&mut Variables) -> Result<T, HResult>,
    ) -> Result<T, HResult> {
        let mut vars = variables::lock(&self.variables).map_err(var_err)?;
        f(&mut vars)
    }

    fn push_source(&self, change: SourceChange) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }

    /// Answer one request. Engine work is queued; everything else completes
    /// before this returns.
    pub fn handle(&self, request: EngineRequest) -> Result<EngineResponse, HResult> {
        trace!(function = request.name(), "Engine request");
        let queued = match request {
            EngineRequest::Detect => Some(EngineAction::Detect),
            EngineRequest::Plan { action } => Some(EngineAction::Plan(action)),
            EngineRequest::Elevate => Some(EngineAction::Elevate),
            EngineRequest::Apply => Some(EngineAction::Apply),
            EngineRequest::Quit { exit_code } => Some(EngineAction::Quit(exit_code)),
            EngineRequest::LaunchApprovedExe {
                id,
                arguments,
                wait_ms,
            } => Some(EngineAction::LaunchApprovedExe {
                id,
                arguments,
                wait: wait_ms.map(Duration::from_millis),
            }),
            other => return self.immediate(other),
        };
        if let Some(action) = queued {
            self.queue.enqueue(action)?;
        }
        Ok(EngineResponse::Done)
    }

    fn immediate(&self, request: EngineRequest) -> Result<EngineResponse, HResult> {
        match request {
            EngineRequest::GetVariableNumeric { name } => self.with_variables(|vars| {
                let value = vars.get_numeric(&name).map_err(var_err)?;
                Ok(EngineResponse::Numeric { value })
            }),
            EngineRequest::GetVariableString { name } => self.with_variables(|vars| {
                let value = vars.get_string(&name).map_err(var_err)?;
                Ok(EngineResponse::String {
                    value: value.as_str().to_string(),
                })
            }),
            EngineRequest::GetVariableVersion { name } => self.with_variables(|vars| {
                let value = vars.get_version(&name).map_err(var_err)?;
                Ok(EngineResponse::Version {
                    value: value.to_string(),
                })
            }),
            EngineRequest::SetVariableNumeric { name, value } => {
                self.activity.ensure_inactive()?;
                self.with_variables(|vars| vars.set_numeric(&name, value).map_err(var_err))?;
                Ok(EngineResponse::Done)
            }
            EngineRequest::SetVariableString {
                name,
                value,
                formatted,
            } => {
                self.activity.ensure_inactive()?;
                self.with_variables(|vars| match value {
                    None => remove(vars, &name),
                    Some(value) if formatted => vars.set_formatted(&name, &value).map_err(var_err),
                    Some(value) => vars.set_string(&name, &value).map_err(var_err),
                })?;
                Ok(EngineResponse::Done)
            }
            EngineRequest::SetVariableVersion { name, value } => {
                self.activity.ensure_inactive()?;
                self.with_variables(|vars| match value {
                    None => remove(vars, &name),
                    Some(text) => vars
                        .set_version(&name, Version::parse(&text))
                        .map_err(var_err),
                })?;
                Ok(EngineResponse::Done)
            }
            EngineRequest::FormatString { input } => self.with_variables(|vars| {
                let value = vars.format(&input).map_err(var_err)?;
                Ok(EngineResponse::String {
                    value: value.as_str().to_string(),
                })
            }),
            EngineRequest::EscapeString { input } => Ok(EngineResponse::String {
                value: Variables::escape(&input),
            }),
            EngineRequest::EvaluateCondition { condition } => self.with_variables(|vars| {
                let value = condition::evaluate(&condition, vars).map_err(|e| {
                    debug!(error = %e, "Condition from application failed to evaluate");
                    e.hresult()
                })?;
                Ok(EngineResponse::Condition { value })
            }),
            EngineRequest::Log { level, message } => {
                log_from_application(level, &message);
                Ok(EngineResponse::Done)
            }
            EngineRequest::SetUpdateSource { url } => {
                self.activity.ensure_inactive()?;
                self.push_source(SourceChange::Update(url));
                Ok(EngineResponse::Done)
            }
            EngineRequest::SetLocalSource {
                id,
                payload_key,
                path,
            } => {
                self.activity.ensure_inactive()?;
                let change = self.index.resolve(&id, payload_key, local_source(path))?;
                self.push_source(change);
                Ok(EngineResponse::Done)
            }
            EngineRequest::SetDownloadSource {
                id,
                payload_key,
                source,
            } => {
                self.activity.ensure_inactive()?;
                let change = self.index.resolve(&id, payload_key, source)?;
                self.push_source(change);
                Ok(EngineResponse::Done)
            }
            queued => {
                warn!(function = queued.name(), "Queued request reached the immediate path");
                Err(HResult::E_INVALIDARG)
            }
        }
    }
}

fn remove(vars: &mut Variables, name: &str) -> Result<(), HResult> {
    match vars.remove(name) {
        Ok(()) | Err(VariableError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.hresult()),
    }
}

/// A local path expressed as a `file://` source the cache understands.
fn local_source(path: PathBuf) -> DownloadSource {
    DownloadSource {
        url: format!("file://{}", path.display()),
        user: None,
        password: None,
    }
}

fn log_from_application(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => error!(target: "burn::ba", "{message}"),
        LogLevel::Warning => warn!(target: "burn::ba", "{message}"),
        LogLevel::Standard => info!(target: "burn::ba", "{message}"),
        LogLevel::Verbose => debug!(target: "burn::ba", "{message}"),
        LogLevel::Debug => trace!(target: "burn::ba", "{message}"),
    }
}

impl RpcService for EngineApi {
    fn call<'a>(&'a mut self, message: PipeMessage) -> BoxFuture<'a, (HResult, Vec<u8>)> {
        Box::pin(async move {
            if message.message_type != MESSAGE_TYPE_ENGINE_REQUEST {
                warn!(message_type = message.message_type, "Unknown engine request type");
                return (HResult::E_NOTIMPL, Vec::new());
            }
            let request: EngineRequest = match serde_json::from_slice(&message.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Malformed engine request");
                    return (HResult::INVALID_DATA, Vec::new());
                }
            };
            let function = request.name();
            match self.handle(request).and_then(|response| {
                serde_json::to_vec(&response).map_err(|_| HResult::E_FAIL)
            }) {
                Ok(data) => (HResult::S_OK, data),
                Err(hr) => {
                    debug!(function, %hr, "Engine request failed");
                    (hr, Vec::new())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BundleAction;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Sample"
        version = "1.0"
        provider_key = "sample"

        [[containers]]
        id = "Media"
        format = "cabinet"

        [[payloads]]
        key = "app.msi"
        file_path = "app.msi"
        container = "Media"

        [[packages]]
        id = "App"
        type = "msi"
        product_code = "{APP}"
        version = "1.0"
        payloads = ["app.msi"]
    "#;

    fn api() -> (EngineApi, Arc<ActionQueue>, Arc<EngineActivity>, PendingSources) {
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        let queue = Arc::new(ActionQueue::new());
        let activity = Arc::new(EngineActivity::new());
        let sources = PendingSources::default();
        let api = EngineApi::new(
            &model,
            Arc::clone(&queue),
            Arc::clone(&activity),
            variables::shared(Variables::new()),
            Arc::clone(&sources),
        );
        (api, queue, activity, sources)
    }

    #[tokio::test]
    async fn test_engine_work_is_queued() {
        let (api, queue, _, _) = api();
        api.handle(EngineRequest::Plan {
            action: BundleAction::Install,
        })
        .unwrap();
        api.handle(EngineRequest::Quit { exit_code: 0 }).unwrap();
        assert_eq!(queue.next().await, EngineAction::Plan(BundleAction::Install));
        assert_eq!(queue.next().await, EngineAction::Quit(0));
    }

    #[test]
    fn test_variables_round_trip() {
        let (api, _, _, _) = api();
        api.handle(EngineRequest::SetVariableString {
            name: "Dir".into(),
            value: Some("/opt/[Name]".into()),
            formatted: false,
        })
        .unwrap();
        api.handle(EngineRequest::SetVariableString {
            name: "Name".into(),
            value: Some("app".into()),
            formatted: false,
        })
        .unwrap();
        let formatted = api
            .handle(EngineRequest::FormatString {
                input: "[Dir]".into(),
            })
            .unwrap();
        assert_eq!(
            formatted,
            EngineResponse::String {
                value: "/opt/[Name]".into()
            }
        );
        let truth = api
            .handle(EngineRequest::EvaluateCondition {
                condition: "Name = \"app\"".into(),
            })
            .unwrap();
        assert_eq!(truth, EngineResponse::Condition { value: true });
        api.handle(EngineRequest::SetVariableString {
            name: "Name".into(),
            value: None,
            formatted: false,
        })
        .unwrap();
        assert_eq!(
            api.handle(EngineRequest::GetVariableString { name: "Name".into() })
                .unwrap_err(),
            HResult::NOT_FOUND
        );
    }

    #[test]
    fn test_setters_refuse_while_active() {
        let (api, _, activity, _) = api();
        let _guard = activity.activate();
        let err = api
            .handle(EngineRequest::SetVariableNumeric {
                name: "X".into(),
                value: 1,
            })
            .unwrap_err();
        assert_eq!(err, HResult::BUSY);
        assert_eq!(
            api.handle(EngineRequest::SetUpdateSource { url: "u".into() })
                .unwrap_err(),
            HResult::BUSY
        );
        // Reads are still answered.
        assert!(
            api.handle(EngineRequest::EscapeString { input: "[x]".into() })
                .is_ok()
        );
    }

    #[test]
    fn test_source_changes_apply_to_model() {
        let (api, _, _, sources) = api();
        api.handle(EngineRequest::SetLocalSource {
            id: "App".into(),
            payload_key: Some("app.msi".into()),
            path: PathBuf::from("/media/app.msi"),
        })
        .unwrap();
        api.handle(EngineRequest::SetDownloadSource {
            id: "Media".into(),
            payload_key: None,
            source: DownloadSource {
                url: "https://example.invalid/media".into(),
                ..DownloadSource::default()
            },
        })
        .unwrap();
        assert_eq!(
            api.handle(EngineRequest::SetLocalSource {
                id: "Nope".into(),
                payload_key: None,
                path: PathBuf::from("/x"),
            })
            .unwrap_err(),
            HResult::NOT_FOUND
        );

        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        apply_source_changes(&sources, &mut model);
        assert_eq!(
            model.payload("app.msi").unwrap().download.as_ref().unwrap().url,
            "file:///media/app.msi"
        );
        assert!(model.container("Media").unwrap().download.is_some());
        assert!(sources.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_rejects_garbage() {
        let (mut api, _, _, _) = api();
        let (hr, _) = api
            .call(PipeMessage::new(MESSAGE_TYPE_ENGINE_REQUEST, b"not json".to_vec()))
            .await;
        assert_eq!(hr, HResult::INVALID_DATA);
        let (hr, _) = api.call(PipeMessage::new(99, Vec::new())).await;
        assert_eq!(hr, HResult::E_NOTIMPL);
    }
}

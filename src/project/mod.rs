//! The project lifecycle orchestrator.
//!
//! A state machine (`Closed → Opening → Open → Closing → Closed`, with
//! `Resetting` transient from `Open`) composing config resolution,
//! scaffolding, the plugin host, spec discovery/watching, the session
//! server, and persisted state.
//!
//! Lifecycle calls must be serialized by the caller: nothing guards a
//! `close()` racing an in-flight `open()` on the same instance. A failed
//! `open()` leaves partially-acquired resources registered on the
//! instance; call `close()` to release them.

pub mod urls;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    self, ConfigSnapshot, ConfigSource, ResolveOptions, SETTINGS_FILE, TestingType,
};
use crate::errors::{ConfigError, PluginError, ProjectError, ResourceError};
use crate::plugins::{
    DevServer, ErrorHandler, PluginHost, PluginInitContext, Preprocessor, RunEvent, WarningHandler,
};
use crate::scaffold::Scaffolder;
use crate::session::{Automation, RunStats, SessionBindings, SessionServer};
use crate::specs::{SpecDescriptor, SpecFinder, SpecSetSubscriber, SpecStore};
use crate::state::{StateStore, StateUpdate};
use crate::watch::{WatchId, WatchRegistry};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Closed,
    Opening,
    Open,
    Resetting,
    Closing,
}

/// External collaborators wired by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub plugin_host: Arc<dyn PluginHost>,
    pub session_server: Arc<dyn SessionServer>,
    pub spec_finder: Arc<dyn SpecFinder>,
    pub scaffolder: Arc<dyn Scaffolder>,
    /// Released on close() for e2e sessions.
    pub preprocessor: Option<Arc<dyn Preprocessor>>,
    /// Receives spec-set changes for component sessions.
    pub dev_server: Option<Arc<dyn DevServer>>,
}

/// Options for one open() call. Unset callbacks get defaults applied as
/// the first step of open().
pub struct OpenOptions {
    pub on_focus_tests: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<ErrorHandler>,
    pub on_warning: Option<WarningHandler>,
    /// Settings-file change forwarding; off by default.
    pub on_settings_changed: Option<Arc<dyn Fn(&Path) + Send + Sync>>,
    pub resolve: ResolveOptions,
    /// Session event subscriptions handed to the server.
    pub bindings: SessionBindings,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            on_focus_tests: None,
            on_error: None,
            on_warning: None,
            on_settings_changed: None,
            resolve: ResolveOptions::default(),
            bindings: SessionBindings::new(),
        }
    }
}

struct NormalizedOptions {
    on_focus_tests: Arc<dyn Fn() + Send + Sync>,
    on_error: ErrorHandler,
    on_warning: WarningHandler,
    on_settings_changed: Option<Arc<dyn Fn(&Path) + Send + Sync>>,
    resolve: ResolveOptions,
    bindings: SessionBindings,
}

fn normalize(options: OpenOptions) -> NormalizedOptions {
    NormalizedOptions {
        on_focus_tests: options.on_focus_tests.unwrap_or_else(|| Arc::new(|| {})),
        on_error: options.on_error.unwrap_or_else(|| {
            Arc::new(|e: &ProjectError| warn!(kind = e.kind(), error = %e, "unhandled project error"))
        }),
        on_warning: options
            .on_warning
            .unwrap_or_else(|| Arc::new(|w: &str| warn!(warning = w, "project warning"))),
        on_settings_changed: options.on_settings_changed,
        resolve: options.resolve,
        bindings: options.bindings,
    }
}

/// Token proving a session is open. Handed out by [`Project::open`] and
/// required by every open-state operation, so call ordering is checked
/// at compile time rather than asserted at run time.
#[derive(Debug)]
pub struct SessionHandle {
    generation: u64,
    pub port: u16,
}

/// One test project and its (at most one) open session.
pub struct Project {
    root: PathBuf,
    testing_type: TestingType,
    collaborators: Collaborators,
    state_store: StateStore,
    state: LifecycleState,
    generation: u64,
    current_config: Option<ConfigSnapshot>,
    current_spec: Option<PathBuf>,
    current_browser: Option<String>,
    automation: Arc<Mutex<Option<Arc<Automation>>>>,
    spec_store: Option<SpecStore>,
    watch_registry: WatchRegistry,
    settings_watch: Option<WatchId>,
    server_open: bool,
    original_cwd: Option<PathBuf>,
}

impl Project {
    /// Construct a project rooted at `root`. Fails synchronously when the
    /// root is missing or not a directory.
    pub fn new(
        root: impl Into<PathBuf>,
        testing_type: TestingType,
        collaborators: Collaborators,
    ) -> Result<Self, ProjectError> {
        let root = root.into();
        if !root.exists() {
            return Err(ConfigError::ProjectRootMissing { path: root }.into());
        }
        if !root.is_dir() {
            return Err(ConfigError::ProjectRootNotDirectory { path: root }.into());
        }
        let root = root.canonicalize().map_err(ProjectError::Io)?;
        Ok(Self {
            root,
            testing_type,
            collaborators,
            state_store: StateStore::new(StateStore::default_dir()),
            state: LifecycleState::Closed,
            generation: 0,
            current_config: None,
            current_spec: None,
            current_browser: None,
            automation: Arc::new(Mutex::new(None)),
            spec_store: None,
            watch_registry: WatchRegistry::new(),
            settings_watch: None,
            server_open: false,
            original_cwd: None,
        })
    }

    /// Override where persisted state lives (defaults to the user's
    /// app-data directory).
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_store = StateStore::new(dir);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn testing_type(&self) -> TestingType {
        self.testing_type
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.state
    }

    /// Config snapshot of the open session, if any.
    pub fn current_config(&self) -> Option<&ConfigSnapshot> {
        self.current_config.as_ref()
    }

    pub fn current_spec(&self) -> Option<&Path> {
        self.current_spec.as_deref()
    }

    pub fn current_browser(&self) -> Option<&str> {
        self.current_browser.as_deref()
    }

    /// Spec set as of the last discovery pass, if a session is open.
    pub fn current_specs(&self) -> Option<Vec<SpecDescriptor>> {
        self.spec_store.as_ref().map(|store| store.current())
    }

    /// Open the session. On failure the instance is left in a partial
    /// state; the caller must invoke [`Project::close`] to recover.
    pub async fn open(&mut self, options: OpenOptions) -> Result<SessionHandle, ProjectError> {
        if self.state != LifecycleState::Closed {
            return Err(ProjectError::Other(anyhow::anyhow!(
                "open() requires a closed project (state: {:?})",
                self.state
            )));
        }
        self.state = LifecycleState::Opening;
        info!(root = %self.root.display(), testing_type = %self.testing_type, "opening project");

        let handle = self.do_open(normalize(options)).await?;

        self.state = LifecycleState::Open;
        info!(port = handle.port, "project open");
        Ok(handle)
    }

    async fn do_open(
        &mut self,
        mut options: NormalizedOptions,
    ) -> Result<SessionHandle, ProjectError> {
        // Resolve config before any plugin or server step; both need the
        // resolved URLs and folders.
        let state_handle = self
            .state_store
            .load(&self.root, options.resolve.is_text_terminal)
            .map_err(ProjectError::State)?;
        let mut cfg = config::resolve(
            &self.root,
            self.testing_type,
            &options.resolve,
            state_handle.get(),
        )?;

        // Plugin init may resolve relative paths against the cwd.
        self.original_cwd = std::env::current_dir().ok();
        std::env::set_current_dir(&self.root).map_err(ProjectError::Io)?;

        // The plugin host refuses to start without its file on disk.
        if cfg.plugins_file.is_some() {
            self.collaborators
                .scaffolder
                .ensure_plugins_stub(&self.root, &cfg)
                .await
                .map_err(ProjectError::Other)?;
        }

        // Re-init after a plugins-file change starts over from this
        // pre-override snapshot.
        let base_cfg = cfg.clone();
        cfg = self.init_plugins(cfg, &options).await?;

        // Spec discovery, filtered by the active testing type.
        let spec_store = SpecStore::new(Arc::clone(&self.collaborators.spec_finder));
        let specs = spec_store
            .discover(&cfg)
            .await
            .map_err(ProjectError::Other)?;
        debug!(count = specs.len(), "initial spec set");

        // Session server; adopt the assigned port when none was pinned.
        let mut bindings = std::mem::take(&mut options.bindings);
        let focus = Arc::clone(&options.on_focus_tests);
        bindings = bindings.on_focus_tests(move || focus());
        let (port, server_warning) = self
            .collaborators
            .session_server
            .open(&cfg, bindings)
            .await
            .map_err(|e| ProjectError::Server(e.to_string()))?;
        self.server_open = true;
        if cfg.port.is_none() {
            cfg.port = Some(port);
            cfg = config::derive_urls(cfg);
        }
        if let Some(warning) = server_warning {
            (options.on_warning)(&warning);
        }

        self.open_barrier(&cfg, state_handle).await?;

        self.start_spec_watcher(&cfg, &spec_store, specs).await?;

        self.verify_and_watch(&cfg, &base_cfg, &options).await?;

        // Optional lifecycle hook, interactive sessions only.
        if !cfg.is_text_terminal && cfg.run_events_enabled {
            let meta = serde_json::json!({
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "runner_version": env!("CARGO_PKG_VERSION"),
                "testing_type": cfg.testing_type.to_string(),
            });
            self.collaborators
                .plugin_host
                .execute_run_event(RunEvent::BeforeRun, &cfg, meta)
                .await
                .map_err(|e| PluginError::RunEventFailed {
                    event: RunEvent::BeforeRun.as_str().to_string(),
                    message: e.to_string(),
                })?;
        }

        let port = cfg.port.expect("port assigned by session server");
        self.spec_store = Some(spec_store);
        self.current_config = Some(cfg);
        self.generation += 1;
        Ok(SessionHandle {
            generation: self.generation,
            port,
        })
    }

    /// Plugin host init with the allow-listed subset, then override
    /// merge. Component sessions always end up flagged, with resolved
    /// testing-type provenance even when the plugin omitted it.
    async fn init_plugins(
        &self,
        cfg: ConfigSnapshot,
        options: &NormalizedOptions,
    ) -> Result<ConfigSnapshot, ProjectError> {
        let ctx = PluginInitContext {
            project_root: self.root.clone(),
            config_file_path: Some(self.root.join(SETTINGS_FILE)),
            testing_type: self.testing_type,
            on_error: Arc::clone(&options.on_error),
            on_warning: Arc::clone(&options.on_warning),
        };
        let overrides = self
            .collaborators
            .plugin_host
            .init(config::allow_list(&cfg), ctx)
            .await
            .map_err(|e| PluginError::InitFailed {
                plugins_file: cfg.plugins_file.clone().unwrap_or_default(),
                message: e.to_string(),
            })?;
        let mut cfg = config::merge_plugin_overrides(cfg, overrides)?;

        if self.testing_type == TestingType::Component {
            cfg.component_testing = true;
            if !cfg.resolved.contains_key("testing_type") {
                cfg.mark_resolved("testing_type", ConfigSource::Options);
            }
        }
        Ok(cfg)
    }

    /// The all-or-nothing open barrier: session-channel wiring, example
    /// scaffolding, and the open-timestamp persist run concurrently. The
    /// first rejection aborts open(); the other tasks keep running
    /// detached, their results discarded.
    async fn open_barrier(
        &mut self,
        cfg: &ConfigSnapshot,
        state_handle: crate::state::StateHandle,
    ) -> Result<(), ProjectError> {
        let automation = Arc::new(Automation::create());
        *self.automation.lock().await = Some(Arc::clone(&automation));

        let server = Arc::clone(&self.collaborators.session_server);
        let channel_cfg = cfg.clone();
        let channel: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(async move { server.start_channel(automation, &channel_cfg).await });

        let scaffolder = Arc::clone(&self.collaborators.scaffolder);
        let scaffold_cfg = cfg.clone();
        let folder = match self.testing_type {
            TestingType::E2e => cfg.integration_folder.clone(),
            TestingType::Component => cfg.component_folder.clone(),
        };
        let scaffold: JoinHandle<anyhow::Result<()>> = tokio::spawn(async move {
            scaffolder
                .ensure_example_specs(&folder, &scaffold_cfg)
                .await?;
            // Only the default support file is scaffolded; a customized
            // path is the user's to provide and is verified later.
            if scaffold_cfg.is_default("support_file") {
                scaffolder.ensure_support_files(&folder, &scaffold_cfg).await?;
            }
            Ok(())
        });

        let persist: JoinHandle<anyhow::Result<()>> = tokio::spawn(async move {
            let now = Utc::now();
            let mut state_handle = state_handle;
            state_handle.merge(StateUpdate {
                first_opened: Some(now),
                last_opened: Some(now),
                ..Default::default()
            })?;
            Ok(())
        });

        async fn flatten(h: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
            match h.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("open barrier task panicked: {e}")),
            }
        }

        tokio::try_join!(flatten(channel), flatten(scaffold), flatten(persist))
            .map(|_| ())
            .map_err(ProjectError::Other)
    }

    /// Start the spec watcher and push the initial spec list.
    async fn start_spec_watcher(
        &mut self,
        cfg: &ConfigSnapshot,
        spec_store: &SpecStore,
        specs: Vec<SpecDescriptor>,
    ) -> Result<(), ProjectError> {
        let server = Arc::clone(&self.collaborators.session_server);
        server
            .send_spec_list(&specs, cfg.testing_type)
            .await
            .map_err(|e| ProjectError::Server(e.to_string()))?;

        let forwarder = Arc::new(SpecForwarder {
            server,
            dev_server: match self.testing_type {
                TestingType::Component => self.collaborators.dev_server.clone(),
                TestingType::E2e => None,
            },
            testing_type: cfg.testing_type,
        });
        spec_store
            .start_watching(&mut self.watch_registry, cfg, forwarder)
            .map_err(ProjectError::Other)?;
        Ok(())
    }

    /// Support-file verification and plugins/settings watches, run
    /// concurrently. Watches are skipped for non-interactive sessions.
    async fn verify_and_watch(
        &mut self,
        cfg: &ConfigSnapshot,
        base_cfg: &ConfigSnapshot,
        options: &NormalizedOptions,
    ) -> Result<(), ProjectError> {
        let verify = async {
            if let Some(support) = &cfg.support_file {
                if !tokio::fs::try_exists(support).await.unwrap_or(false) {
                    return Err(ProjectError::Resource(ResourceError::SupportFileMissing {
                        path: support.clone(),
                        searched: vec![support.clone()],
                    }));
                }
            }
            Ok(())
        };

        let (verified, watched) = tokio::join!(verify, async {
            if cfg.is_text_terminal {
                return Ok(());
            }
            self.watch_plugins_and_settings(cfg, base_cfg, options)
        });
        verified?;
        watched
    }

    fn watch_plugins_and_settings(
        &mut self,
        cfg: &ConfigSnapshot,
        base_cfg: &ConfigSnapshot,
        options: &NormalizedOptions,
    ) -> Result<(), ProjectError> {
        if let Some(plugins_file) = &cfg.plugins_file {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
            self.watch_registry
                .watch(
                    plugins_file,
                    Arc::new(move |_: &Path| {
                        let _ = tx.send(());
                    }),
                )
                .map_err(ProjectError::Other)?;

            let reinit = ReinitContext {
                plugin_host: Arc::clone(&self.collaborators.plugin_host),
                base_config: base_cfg.clone(),
                root: self.root.clone(),
                testing_type: self.testing_type,
                automation: Arc::clone(&self.automation),
                on_error: Arc::clone(&options.on_error),
                on_warning: Arc::clone(&options.on_warning),
            };
            tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    run_reinit_cycle(&reinit).await;
                }
            });
        }

        if let Some(on_settings_changed) = &options.on_settings_changed {
            let settings = self.root.join(SETTINGS_FILE);
            if settings.exists() {
                let forward = Arc::clone(on_settings_changed);
                let id = self
                    .watch_registry
                    .watch(
                        &settings,
                        Arc::new(move |path: &Path| forward(path)),
                    )
                    .map_err(ProjectError::Other)?;
                self.settings_watch = Some(id);
            }
        }
        Ok(())
    }

    /// Clear per-run state. Idempotent; safe with no automation session.
    pub async fn reset(&mut self, session: &SessionHandle) -> Result<(), ProjectError> {
        self.check_handle(session)?;
        self.state = LifecycleState::Resetting;
        self.current_spec = None;
        self.current_browser = None;

        if let Some(automation) = self.automation.lock().await.as_ref() {
            automation.reset().await;
        }
        if self.server_open {
            self.collaborators
                .session_server
                .reset()
                .await
                .map_err(|e| ProjectError::Server(e.to_string()))?;
        }
        self.state = LifecycleState::Open;
        Ok(())
    }

    /// Record the spec/browser pair the session is focused on.
    pub fn set_current_spec_and_browser(
        &mut self,
        session: &SessionHandle,
        spec: Option<PathBuf>,
        browser: Option<String>,
    ) -> Result<(), ProjectError> {
        self.check_handle(session)?;
        self.current_spec = spec;
        self.current_browser = browser;
        Ok(())
    }

    /// Finish the session and collect run stats.
    pub async fn end_session(&mut self, session: &SessionHandle) -> Result<RunStats, ProjectError> {
        self.check_handle(session)?;
        self.collaborators
            .session_server
            .end()
            .await
            .map_err(|e| ProjectError::Server(e.to_string()))
    }

    /// Return the configured project id, generating and persisting one
    /// when absent. The settings write is marked programmatic so the
    /// settings watch does not fire for it.
    pub fn ensure_project_id(&mut self, session: &SessionHandle) -> Result<String, ProjectError> {
        self.check_handle(session)?;
        let cfg = self
            .current_config
            .as_mut()
            .expect("open session has a config");
        if let Some(id) = &cfg.project_id {
            return Ok(id.clone());
        }
        let id = Uuid::new_v4().to_string();
        if let Some(watch_id) = self.settings_watch {
            self.watch_registry.mark_programmatic_write(watch_id);
        }
        config::write_project_id(&self.root, &id)?;
        cfg.project_id = Some(id.clone());
        Ok(id)
    }

    /// Release every session resource. Valid from `Open`; a guarded
    /// no-op when the project was never (successfully) opened and holds
    /// nothing.
    pub async fn close(&mut self) -> Result<(), ProjectError> {
        let was_open = self.state == LifecycleState::Open;
        let holds_nothing = !self.server_open
            && self.watch_registry.active_count() == 0
            && self.current_config.is_none()
            && self.original_cwd.is_none();
        if self.state == LifecycleState::Closed && holds_nothing {
            return Ok(());
        }
        self.state = LifecycleState::Closing;

        // after:run gets the final config, before it is dropped.
        if was_open {
            if let Some(cfg) = &self.current_config {
                if !cfg.is_text_terminal && cfg.run_events_enabled {
                    if let Err(e) = self
                        .collaborators
                        .plugin_host
                        .execute_run_event(RunEvent::AfterRun, cfg, serde_json::Value::Null)
                        .await
                    {
                        warn!(error = %e, "after:run hook failed");
                    }
                }
            }
        }

        let server_close = async {
            if self.server_open {
                self.collaborators
                    .session_server
                    .close()
                    .await
                    .map_err(|e| ProjectError::Server(e.to_string()))
            } else {
                Ok(())
            }
        };
        let preprocessor_close = async {
            if self.testing_type == TestingType::E2e {
                if let Some(preprocessor) = &self.collaborators.preprocessor {
                    return preprocessor
                        .close()
                        .await
                        .map_err(ProjectError::Other);
                }
            }
            Ok(())
        };
        let (server_result, preprocessor_result) = tokio::join!(server_close, preprocessor_close);

        self.watch_registry.close_all();
        self.settings_watch = None;
        if let Some(automation) = self.automation.lock().await.take() {
            automation.close().await;
        }
        if let Some(cwd) = self.original_cwd.take() {
            let _ = std::env::set_current_dir(cwd);
        }

        self.server_open = false;
        self.current_config = None;
        self.current_spec = None;
        self.current_browser = None;
        self.spec_store = None;
        self.state = LifecycleState::Closed;
        info!(root = %self.root.display(), "project closed");

        server_result?;
        preprocessor_result
    }

    fn check_handle(&self, session: &SessionHandle) -> Result<(), ProjectError> {
        if session.generation != self.generation || self.current_config.is_none() {
            return Err(ProjectError::Other(anyhow::anyhow!(
                "session handle does not match an open session (handle {}, current {})",
                session.generation,
                self.generation
            )));
        }
        Ok(())
    }
}

/// Forwards spec-set changes to the session server and, for component
/// sessions, the dev server.
struct SpecForwarder {
    server: Arc<dyn SessionServer>,
    dev_server: Option<Arc<dyn DevServer>>,
    testing_type: TestingType,
}

impl SpecSetSubscriber for SpecForwarder {
    fn on_specs_changed(&self, specs: &[SpecDescriptor]) {
        let server = Arc::clone(&self.server);
        let dev_server = self.dev_server.clone();
        let testing_type = self.testing_type;
        let specs = specs.to_vec();
        tokio::spawn(async move {
            if let Err(e) = server.send_spec_list(&specs, testing_type).await {
                warn!(error = %e, "failed to forward spec list");
            }
            if let Some(dev_server) = dev_server {
                if let Err(e) = dev_server.update_specs(&specs).await {
                    warn!(error = %e, "failed to update dev server specs");
                }
            }
        });
    }
}

/// Everything a watch-triggered plugin re-init needs, captured at open
/// time. Re-init always runs against the original base config, never a
/// previously-merged snapshot.
struct ReinitContext {
    plugin_host: Arc<dyn PluginHost>,
    base_config: ConfigSnapshot,
    root: PathBuf,
    testing_type: TestingType,
    automation: Arc<Mutex<Option<Arc<Automation>>>>,
    on_error: ErrorHandler,
    on_warning: WarningHandler,
}

/// One re-init cycle. Failures are delivered through `on_error` only —
/// never a rejected future the open() caller holds — after closing any
/// active automation session. A failed cycle does not stop later ones.
async fn run_reinit_cycle(ctx: &ReinitContext) {
    debug!(root = %ctx.root.display(), "plugins file changed, re-initializing");
    let init_ctx = PluginInitContext {
        project_root: ctx.root.clone(),
        config_file_path: Some(ctx.root.join(SETTINGS_FILE)),
        testing_type: ctx.testing_type,
        on_error: Arc::clone(&ctx.on_error),
        on_warning: Arc::clone(&ctx.on_warning),
    };
    let result = ctx
        .plugin_host
        .init(config::allow_list(&ctx.base_config), init_ctx)
        .await
        .map_err(|e| {
            ProjectError::Plugin(PluginError::InitFailed {
                plugins_file: ctx.base_config.plugins_file.clone().unwrap_or_default(),
                message: e.to_string(),
            })
        })
        .and_then(|overrides| {
            config::merge_plugin_overrides(ctx.base_config.clone(), overrides)
                .map_err(ProjectError::Plugin)
        });

    match result {
        Ok(merged) => {
            debug!(version = merged.version, "plugins re-initialized");
        }
        Err(error) => {
            // A stale automation session must not outlive a broken
            // plugin environment.
            if let Some(automation) = ctx.automation.lock().await.take() {
                automation.close().await;
            }
            (ctx.on_error)(&error);
        }
    }
}

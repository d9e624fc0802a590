//! Sync Engine - watches projects and turns their changes into pushes
//!
//! Owns the change notifier, the debounce table and the state machine, and
//! drives them from a fixed tick. Each dispatched reconciliation runs on its
//! own tokio task; reconciliations of one project never overlap.

use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::debounce::{Debouncer, Decision};
use crate::error::{Result, SyncError};
use crate::git::{strip_credential, BootstrapRequest, GitClient, StatusReport, SyncOutcome};
use crate::hosting::{self, CredentialProvider, HostingProvider};
use crate::progress::ProgressSink;
use crate::project::{ProjectId, SyncStatus, WatchedProject};
use crate::registry::ProjectRegistry;
use crate::schedule::SchedulePolicy;
use crate::state::{Completion, ProjectStates, SyncTicket};
use crate::watcher::{ChangeCallback, ChangeFilter, ChangeNotifier};

const AUTO_LABEL: &str = "Auto backup";
const MANUAL_LABEL: &str = "Manual backup";

/// What a watch-set refresh changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: Vec<ProjectId>,
    pub removed: Vec<ProjectId>,
    /// Projects whose watch could not be established, with the reason
    pub failed: Vec<(ProjectId, String)>,
    /// Projects watched after the refresh
    pub watched: usize,
}

/// The synchronization engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: Arc<dyn ProjectRegistry>,
    hosting: Arc<dyn HostingProvider>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn ProgressSink>,
    git: GitClient,
    notifier: ChangeNotifier,
    debouncer: Arc<Debouncer>,
    states: Arc<ProjectStates>,
    schedule: SchedulePolicy,
    tick: Duration,
    refresh: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Roots whose watch failed; refreshes skip them until the path changes
    unwatchable: Mutex<HashMap<ProjectId, PathBuf>>,
}

impl SyncEngine {
    /// Create an engine. Nothing is watched until [`start`](Self::start) or
    /// [`watch`](Self::watch) is called.
    pub fn new(
        config: &Config,
        registry: Arc<dyn ProjectRegistry>,
        hosting: Arc<dyn HostingProvider>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let filter = ChangeFilter::new(&config.watcher.ignore_patterns).with_state_file(config.database_path());

        Self {
            inner: Arc::new(EngineInner {
                registry,
                hosting,
                credentials,
                sink,
                git: GitClient::new(config),
                notifier: ChangeNotifier::new(filter),
                debouncer: Arc::new(Debouncer::new()),
                states: Arc::new(ProjectStates::new()),
                schedule: SchedulePolicy::from_config(config),
                tick: config.tick_interval(),
                refresh: config.refresh_interval(),
                workers: Mutex::new(Vec::new()),
                unwatchable: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.inner.debouncer
    }

    pub fn states(&self) -> &ProjectStates {
        &self.inner.states
    }

    pub fn git(&self) -> &GitClient {
        &self.inner.git
    }

    pub fn is_watching(&self, id: ProjectId) -> bool {
        self.inner.notifier.is_watching(id)
    }

    /// Normalize interrupted syncs and watch every auto-push project
    pub fn start(&self) -> Result<RefreshSummary> {
        self.recover_interrupted()?;
        self.refresh_watch_set()
    }

    /// Registry rows left in `syncing` by a previous process are reset to idle
    fn recover_interrupted(&self) -> Result<()> {
        for project in self.inner.registry.list_projects()? {
            if project.status == SyncStatus::Syncing && !self.inner.states.is_syncing(project.id) {
                warn!(
                    "Project {} ({}) was left syncing by a previous run, resetting to idle",
                    project.id, project.name
                );
                self.inner.registry.update_status(project.id, SyncStatus::Idle)?;
            }
        }
        Ok(())
    }

    /// Start watching a project. Projects with auto-push disabled are unwatched
    /// instead. Returns whether a new watch was established.
    pub fn watch(&self, project: &WatchedProject) -> Result<bool> {
        let id = project.id;
        if !project.policy.auto_push {
            self.unwatch(id);
            return Ok(false);
        }

        self.inner.debouncer.enable(id);

        let debouncer = Arc::clone(&self.inner.debouncer);
        let on_change: ChangeCallback = Arc::new(move |id| {
            debouncer.record_change(id);
        });

        match self.inner.notifier.watch(id, &project.path, on_change) {
            Ok(added) => {
                self.inner.unwatchable.lock().remove(&id);
                if added {
                    self.inner
                        .sink
                        .info(&format!("Watching {} for changes", project.name), Some(id));
                }
                Ok(added)
            }
            Err(e) => {
                self.inner.debouncer.disable(id);
                self.inner
                    .sink
                    .error(&format!("Could not watch {}: {}", project.path.display(), e), Some(id));
                Err(e)
            }
        }
    }

    /// Stop watching a project and drop its pending marker
    pub fn unwatch(&self, id: ProjectId) -> bool {
        let dropped = self.inner.debouncer.disable(id);
        if dropped {
            debug!("Dropped pending marker of project {}", id);
        }
        self.inner.states.forget(id);
        self.inner.notifier.unwatch(id)
    }

    /// Reconcile the watch set with the registry's auto-push projects
    pub fn refresh_watch_set(&self) -> Result<RefreshSummary> {
        let projects = self.inner.registry.list_auto_push_projects()?;
        let wanted: HashSet<ProjectId> = projects.iter().map(|p| p.id).collect();
        let mut summary = RefreshSummary::default();

        for id in self.inner.notifier.watched() {
            if !wanted.contains(&id) {
                self.unwatch(id);
                summary.removed.push(id);
            }
        }

        self.inner.unwatchable.lock().retain(|id, _| wanted.contains(id));

        for project in &projects {
            let known_bad = self.inner.unwatchable.lock().get(&project.id) == Some(&project.path);
            if known_bad {
                continue;
            }
            match self.watch(project) {
                Ok(true) => summary.added.push(project.id),
                Ok(false) => {}
                Err(e) => {
                    self.inner.unwatchable.lock().insert(project.id, project.path.clone());
                    summary.failed.push((project.id, e.to_string()));
                }
            }
        }

        summary.watched = self.inner.notifier.watched().len();
        if !summary.added.is_empty() || !summary.removed.is_empty() {
            info!(
                "Watch set refreshed: {} added, {} removed, {} watched",
                summary.added.len(),
                summary.removed.len(),
                summary.watched
            );
        }
        Ok(summary)
    }

    /// Changed files of a project's working tree
    pub async fn scan_status(&self, id: ProjectId) -> Result<StatusReport> {
        let project = self.project(id)?;
        self.inner.git.get_status(&project.path).await
    }

    /// Sync a project now, waiting for the result.
    ///
    /// Shares the state machine with scheduled syncs, so it fails with
    /// `AlreadySyncing` while another sync of the project is in flight, in
    /// this process or in another one using the same registry.
    pub async fn trigger_manual_sync(&self, id: ProjectId) -> Result<SyncOutcome> {
        let project = self.project(id)?;
        let ticket = self.begin(id)?;

        // This sync covers whatever was pending
        self.inner.debouncer.take(id);
        self.inner.sink.info(&format!("Manual sync of {}", project.name), Some(id));

        self.reconcile(&project, ticket, MANUAL_LABEL).await
    }

    /// Run one scheduler pass at `now`. Returns the projects dispatched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn tick(&self, now: DateTime<Local>) -> Vec<ProjectId> {
        let inner = &self.inner;
        let mut live: HashMap<ProjectId, WatchedProject> = HashMap::new();
        let mut dropped = Vec::new();

        let due = inner.debouncer.drain_due(|id, _| {
            let project = match inner.registry.get(id) {
                Ok(project) => project,
                Err(e) => {
                    warn!("Could not look up project {}: {}", id, e);
                    return Decision::NotDue;
                }
            };

            let decision = inner
                .schedule
                .decide(project.as_ref(), inner.states.is_syncing(id), now);
            match decision {
                Decision::Due => {
                    if let Some(project) = project {
                        live.insert(id, project);
                    }
                }
                Decision::Drop => dropped.push(id),
                Decision::NotDue => {}
            }
            decision
        });

        for id in dropped {
            debug!("Project {} is no longer eligible, unwatching", id);
            self.unwatch(id);
        }

        let mut dispatched = Vec::new();
        for (id, changed_at) in due {
            let Some(project) = live.remove(&id) else {
                continue;
            };
            match self.begin(id) {
                Ok(ticket) => {
                    self.dispatch(project, ticket);
                    dispatched.push(id);
                }
                Err(e) => {
                    // Another sync holds the project; retry on a later tick
                    debug!("Deferring sync of project {}: {}", id, e);
                    inner.debouncer.restore(id, changed_at);
                }
            }
        }

        dispatched
    }

    /// Enter `syncing` in this process and in the registry. The registry
    /// claim keeps a CLI sync and the daemon off the same working tree.
    fn begin(&self, id: ProjectId) -> Result<SyncTicket> {
        let ticket = self.inner.states.try_begin(id)?;
        match self.inner.registry.try_claim(id) {
            Ok(true) => Ok(ticket),
            Ok(false) => {
                ticket.cancel();
                Err(SyncError::AlreadySyncing(id))
            }
            Err(e) => {
                ticket.cancel();
                Err(e.into())
            }
        }
    }

    fn dispatch(&self, project: WatchedProject, ticket: SyncTicket) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let id = project.id;
            if let Err(e) = engine.reconcile(&project, ticket, AUTO_LABEL).await {
                debug!("Scheduled sync of project {} failed: {}", id, e);
            }
        });

        let mut workers = self.inner.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.push(handle);
    }

    /// Check for changes, push them and record the outcome.
    /// `ticket` proves the project is in `syncing`.
    async fn reconcile(&self, project: &WatchedProject, ticket: SyncTicket, label: &str) -> Result<SyncOutcome> {
        let inner = &self.inner;
        let id = project.id;
        let result = self.push_changes(project, label).await;

        match &result {
            Ok(SyncOutcome::Pushed { branch, files }) => {
                if let Err(e) = inner.registry.update_last_sync(id, Utc::now()) {
                    warn!("Could not record last sync of project {}: {}", id, e);
                }
                self.persist_status(id, SyncStatus::Idle);
                ticket.complete(Completion::Synced);
                inner
                    .sink
                    .success(&format!("Pushed {} changed files to {}", files, branch), Some(id));
            }
            Ok(SyncOutcome::NoChanges) => {
                self.persist_status(id, SyncStatus::Idle);
                ticket.complete(Completion::Checked);
            }
            Err(e) => {
                self.persist_status(id, SyncStatus::Error);
                ticket.complete(Completion::Failed);
                inner.sink.error(&format!("Sync failed: {}", e), Some(id));
            }
        }

        result
    }

    async fn push_changes(&self, project: &WatchedProject, label: &str) -> Result<SyncOutcome> {
        let inner = &self.inner;
        let status = inner.git.get_status(&project.path).await?;

        if status.is_clean() {
            inner.sink.info("No changes to push", Some(project.id));
            return Ok(SyncOutcome::NoChanges);
        }

        inner.sink.info(
            &format!("Detected {} changed files, syncing", status.count),
            Some(project.id),
        );
        let message = project.policy.commit_message(label);
        inner.git.sync(&project.path, &message).await
    }

    fn persist_status(&self, id: ProjectId, status: SyncStatus) {
        if let Err(e) = self.inner.registry.update_status(id, status) {
            warn!("Could not persist status {} of project {}: {}", status, id, e);
        }
    }

    /// Initialize, publish and push a folder for the first time.
    /// Returns the canonical remote URL.
    pub async fn bootstrap_project(&self, mut request: BootstrapRequest) -> Result<String> {
        if request.token.is_none() {
            request.token = Some(self.token().await?);
        }

        let result = self
            .inner
            .git
            .bootstrap_and_push(&request, self.inner.hosting.as_ref(), self.inner.sink.as_ref())
            .await;

        if let Err(e) = &result {
            self.inner
                .sink
                .error(&format!("Bootstrap of {} failed: {}", request.path.display(), e), request.project_id);
        }
        result
    }

    /// Whether the project's hosted repository is private
    pub async fn get_visibility(&self, id: ProjectId) -> Result<bool> {
        let (remote_url, token) = self.hosted(id).await?;
        let result = hosting::get_visibility(self.inner.hosting.as_ref(), &token, &remote_url).await;
        self.report_orphan(id, &result);
        result
    }

    /// Change the project's hosted repository visibility
    pub async fn update_visibility(&self, id: ProjectId, is_private: bool) -> Result<()> {
        let (remote_url, token) = self.hosted(id).await?;
        let result =
            hosting::update_visibility(self.inner.hosting.as_ref(), &token, &remote_url, is_private).await;
        self.report_orphan(id, &result);

        if result.is_ok() {
            let visibility = if is_private { "private" } else { "public" };
            self.inner
                .sink
                .success(&format!("Repository is now {}", visibility), Some(id));
        }
        result
    }

    /// Delete the project's hosted repository. A repository that is already
    /// gone counts as deleted; returns whether anything was removed.
    pub async fn delete_remote(&self, id: ProjectId) -> Result<bool> {
        let (remote_url, token) = self.hosted(id).await?;
        let deleted = hosting::delete_repository(self.inner.hosting.as_ref(), &token, &remote_url).await?;

        let message = if deleted {
            format!("Deleted hosted repository {}", strip_credential(&remote_url))
        } else {
            format!("Hosted repository {} was already gone", strip_credential(&remote_url))
        };
        self.inner.sink.info(&message, Some(id));
        Ok(deleted)
    }

    fn report_orphan<T>(&self, id: ProjectId, result: &Result<T>) {
        if let Err(SyncError::RepositoryNotFound(name)) = result {
            self.inner.sink.error(
                &format!("Repository {} no longer exists on the hosting provider", name),
                Some(id),
            );
        }
    }

    async fn hosted(&self, id: ProjectId) -> Result<(String, String)> {
        let project = self.project(id)?;
        let remote_url = project
            .remote_url
            .ok_or_else(|| SyncError::NoRemoteConfigured(project.path.clone()))?;
        Ok((remote_url, self.token().await?))
    }

    /// Token lookup may shell out to `gh`, so it runs off the async workers
    async fn token(&self) -> Result<String> {
        let credentials = Arc::clone(&self.inner.credentials);
        tokio::task::spawn_blocking(move || credentials.get_hosting_token())
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
            .ok_or(SyncError::MissingCredentials)
    }

    fn project(&self, id: ProjectId) -> Result<WatchedProject> {
        self.inner
            .registry
            .get(id)?
            .ok_or(SyncError::ProjectNotFound(id))
    }

    /// Drive the scheduler until `shutdown` fires, then stop watching and wait
    /// for in-flight syncs.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.inner.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.inner.refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler running with a {:?} tick", self.inner.tick);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let dispatched = self.tick(Local::now());
                    if !dispatched.is_empty() {
                        debug!("Dispatched syncs for {:?}", dispatched);
                    }
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_watch_set() {
                        warn!("Failed to refresh watch set: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop all watchers and wait for in-flight syncs
    pub async fn shutdown(&self) {
        self.inner.notifier.clear();
        let in_flight = self.inner.states.in_flight();
        if !in_flight.is_empty() {
            info!("Waiting for in-flight syncs of {:?}", in_flight);
        }
        self.wait_idle().await;
        info!("Sync engine stopped");
    }

    /// Wait for every dispatched sync to finish
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
            if handles.is_empty() {
                return;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!("Sync task failed: {}", e);
                }
            }
        }
    }
}

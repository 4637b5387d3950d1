//! Job runner
//!
//! Registers a task, runs its script, records the outcome and tells every
//! notificator. A failing script still leaves a finished record behind.

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use stowage_common::{Error, Metadata, Result, TaskId};
use stowage_meta_store::MetaManager;
use tracing::{debug, info, warn};

use crate::components::{ExecutionOutcome, Executor, Notificator, ScriptPool};

/// Static description of a backup job
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: String,
    /// Script name resolved through the script pool
    pub command: String,
    /// Storage sub-path for the job's files
    pub namespace: String,
    pub gzip: bool,
    /// How long files are kept after the task starts
    pub max_age: TimeDelta,
}

pub struct JobRunner {
    meta: Arc<dyn MetaManager>,
    scripts: Arc<dyn ScriptPool>,
    executor: Arc<dyn Executor>,
    notificators: Vec<Arc<dyn Notificator>>,
}

impl JobRunner {
    pub fn new(
        meta: Arc<dyn MetaManager>,
        scripts: Arc<dyn ScriptPool>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            meta,
            scripts,
            executor,
            notificators: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_notificator(mut self, notificator: Arc<dyn Notificator>) -> Self {
        self.notificators.push(notificator);
        self
    }

    /// Run `job` once and return its final record
    pub async fn run(&self, job: &JobSpec) -> Result<Metadata> {
        let task_id = TaskId::generate();
        info!("Job {}: starting task {}", job.name, task_id);

        let mut md = Metadata::new(task_id.clone(), Utc::now(), job.max_age);
        md.job_name.clone_from(&job.name);
        md.command.clone_from(&job.command);
        md.namespace.clone_from(&job.namespace);
        md.gzip = job.gzip;

        let script = self.scripts.backup_script(&job.command).await;
        if let Ok(script) = &script {
            md.script.clone_from(script);
        }

        if let Err(e) = self.meta.add(&task_id, md).await {
            self.metadata_failed(&e).await;
            return Err(e);
        }

        let outcome = match script {
            Ok(script) => self.executor.execute(&script).await,
            Err(e) => {
                warn!("Job {}: cannot get script {}: {}", job.name, job.command, e);
                ExecutionOutcome::not_started(e.to_string())
            }
        };
        if let Err(message) = &outcome.result {
            warn!("Job {}: task {} failed: {}", job.name, task_id, message);
        }

        let finished = self
            .meta
            .update(
                &task_id,
                Box::new(move |md: &mut Metadata| {
                    md.pid = outcome.pid;
                    md.output = outcome.output;
                    md.errput = outcome.errput;
                    md.finish(outcome.result, Utc::now());
                }),
            )
            .await;
        let md = match finished {
            Ok(md) => md,
            Err(e) => {
                self.metadata_failed(&e).await;
                return Err(e);
            }
        };

        info!(
            "Job {}: task {} finished, success={} files={} size={}",
            job.name,
            task_id,
            md.success,
            md.files.len(),
            md.total_size
        );
        for n in &self.notificators {
            match n.job_finished(&md).await {
                Ok(()) => debug!("Notificator {} told about task {}", n.name(), task_id),
                Err(e) => warn!("Notificator {} failed for task {}: {}", n.name(), task_id, e),
            }
        }
        Ok(md)
    }

    async fn metadata_failed(&self, err: &Error) {
        warn!("Metadata access failed: {err}");
        for n in &self.notificators {
            if let Err(e) = n.metadata_access_failed(err).await {
                warn!("Notificator {} failed: {}", n.name(), e);
            }
        }
    }
}

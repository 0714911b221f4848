//! The dispatch loop: matches pending jobs to eligible workers under each
//! queue's strategy.
//!
//! One iteration runs whenever queue/worker/job state changes (bus wakeup)
//! or on a 250 ms watchdog tick. Reservation is an atomic check-and-set in
//! the repository; losing the race restarts selection for that queue.

use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DISPATCH_TICK_MS;
use crate::error::Result;
use crate::events::{EventBus, LogKind};
use crate::jobs::JobController;
use crate::logstore::LogStore;
use crate::model::{DispatchStrategy, Job, Queue, Worker, WorkerKind, WorkerStatus};
use crate::repo::Repository;
use crate::transport::{ExecuteRequest, JobStreamEvent, WorkerClient};

pub struct Dispatcher {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
    client: WorkerClient,
    controller: Arc<JobController>,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        logs: Arc<LogStore>,
        client: WorkerClient,
        controller: Arc<JobController>,
    ) -> Self {
        Self {
            repo,
            bus,
            logs,
            client,
            controller,
        }
    }

    /// Run until cancelled. Suspends when no work is available; woken by
    /// new-job, worker-change, and job-completion events or the watchdog.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Dispatch loop started");
        let mut tick =
            tokio::time::interval(std::time::Duration::from_millis(DISPATCH_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.bus.dispatch_wakeup() => {}
                _ = tick.tick() => {}
            }
            if let Err(e) = self.dispatch_pass(&cancel).await {
                tracing::error!(error = %e, "Dispatch pass failed");
            }
        }
        tracing::info!("Dispatch loop stopped");
    }

    /// One pass over all started queues, highest priority first.
    pub async fn dispatch_pass(&self, cancel: &CancellationToken) -> Result<()> {
        let (mut queues, _) = self.repo.list_queues(crate::repo::Page {
            page: 1,
            per_page: 500,
        })
        .await?;
        queues.retain(|q| q.state.dispatches());
        queues.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        for queue in queues {
            if cancel.is_cancelled() {
                break;
            }
            self.dispatch_queue(&queue, cancel).await?;
        }
        Ok(())
    }

    /// Drain a single queue until it runs out of pending jobs or eligible
    /// workers.
    async fn dispatch_queue(&self, queue: &Queue, cancel: &CancellationToken) -> Result<()> {
        loop {
            let Some(job) = self.repo.oldest_pending_job(&queue.name).await? else {
                return Ok(());
            };

            let mut eligible = Vec::new();
            for worker in self.repo.queue_workers(queue.id).await? {
                let load = self.repo.count_running_for_worker(&worker.name).await?;
                if worker.is_eligible(load) {
                    eligible.push((worker, load));
                }
            }
            if eligible.is_empty() {
                return Ok(());
            }

            let worker = self.pick_worker(queue, &eligible).await?;

            let Some(reserved) = self.repo.reserve_job(job.id, &worker).await? else {
                // Lost the reservation race; restart selection for this queue.
                continue;
            };
            self.bus.publish_job(reserved.clone());
            self.queue_log(
                queue,
                &format!("Dispatching job {} to worker '{}'", job.id, worker.name),
            )
            .await;

            match self.hand_off(queue, &reserved, &worker, cancel).await {
                Ok(()) => {}
                Err(e) => {
                    self.recover_failed_handoff(queue, &reserved, &worker, &e).await?;
                    // The worker is quarantined; re-evaluate eligibility.
                    continue;
                }
            }
        }
    }

    /// Build the command and post it to the worker; on acceptance, start
    /// the event pump that carries the worker's log/terminal stream back.
    async fn hand_off(
        &self,
        queue: &Queue,
        job: &Job,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(spec) = self.repo.get_spec_by_name(&job.spec_name).await? else {
            // Permanent: the spec vanished between intake and dispatch.
            self.controller
                .ingest_terminal(
                    job.id,
                    crate::model::JobStatus::Failed,
                    None,
                    Some(format!("spec '{}' not found", job.spec_name)),
                )
                .await?;
            return Ok(());
        };
        let command = render_command(&spec.command, &job.runtime_args);
        let request = ExecuteRequest {
            job_id: job.id,
            command,
            runtime_args: job.runtime_args.clone(),
            time_limit_secs: queue.time_limit_secs,
        };
        self.client.execute(worker, &request).await?;

        self.controller
            .ingest_log(job.id, &format!("Dispatched to worker '{}'", worker.name))
            .await;
        tracing::info!(job_id = %job.id, worker = %worker.name, queue = %queue.name, "Job dispatched");
        self.spawn_event_pump(job.id, worker.clone(), cancel.child_token());
        Ok(())
    }

    /// Transport hand-off failed after retries: the job returns to the
    /// queue and the worker is quarantined until the health monitor clears
    /// it.
    async fn recover_failed_handoff(
        &self,
        queue: &Queue,
        job: &Job,
        worker: &Worker,
        error: &crate::error::DispatchError,
    ) -> Result<()> {
        tracing::warn!(
            job_id = %job.id,
            worker = %worker.name,
            error = %error,
            "Dispatch hand-off failed, releasing job"
        );
        if let Some(released) = self.repo.release_job(job.id).await? {
            self.bus.publish_job(released);
        }
        self.controller
            .ingest_log(
                job.id,
                &format!("Dispatch to worker '{}' failed: {error}", worker.name),
            )
            .await;
        self.queue_log(
            queue,
            &format!(
                "Dispatch of job {} to worker '{}' failed: {error}",
                job.id, worker.name
            ),
        )
        .await;
        let quarantined = self
            .repo
            .set_worker_status(
                worker.id,
                WorkerStatus::Error,
                Some(error.to_string()),
                None,
            )
            .await?;
        self.bus.publish_worker(quarantined);
        Ok(())
    }

    /// Strategy selection over the eligible set. `eligible` is ordered by
    /// worker id ascending and carries each worker's current load.
    async fn pick_worker(&self, queue: &Queue, eligible: &[(Worker, u32)]) -> Result<Worker> {
        let picked = match queue.strategy {
            DispatchStrategy::RoundRobin => {
                // The cursor advances regardless of the dispatch outcome.
                let cursor = self.repo.advance_rr_cursor(queue.id).await?;
                let index = cursor as usize % eligible.len();
                eligible[index].0.clone()
            }
            DispatchStrategy::LeastLoaded => least_loaded(eligible),
            DispatchStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..eligible.len());
                eligible[index].0.clone()
            }
            DispatchStrategy::Priority => {
                let locals: Vec<(Worker, u32)> = eligible
                    .iter()
                    .filter(|(w, _)| w.kind == WorkerKind::Local)
                    .cloned()
                    .collect();
                if locals.is_empty() {
                    least_loaded(eligible)
                } else {
                    least_loaded(&locals)
                }
            }
        };
        Ok(picked)
    }

    /// Consume the worker's per-job SSE stream, feeding log lines,
    /// progress, and the terminal status into the controller.
    fn spawn_event_pump(&self, job_id: Uuid, worker: Worker, cancel: CancellationToken) {
        let client = self.client.clone();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            let mut events = None;
            for attempt in 0..3u32 {
                match client
                    .stream_job_events(&worker, job_id, cancel.clone())
                    .await
                {
                    Ok(rx) => {
                        events = Some(rx);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job_id,
                            worker = %worker.name,
                            attempt = attempt + 1,
                            error = %e,
                            "Failed to open worker event stream"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
            let Some(mut events) = events else {
                tracing::error!(
                    job_id = %job_id,
                    worker = %worker.name,
                    "Giving up on worker event stream; health monitor will reconcile"
                );
                return;
            };

            let mut saw_terminal = false;
            while let Some(event) = events.recv().await {
                match event {
                    JobStreamEvent::LogLine(line) => {
                        controller.ingest_log(job_id, &line).await;
                    }
                    JobStreamEvent::Progress(progress) => {
                        if let Err(e) = controller.ingest_progress(job_id, progress).await {
                            tracing::error!(job_id = %job_id, error = %e, "Progress update failed");
                        }
                    }
                    JobStreamEvent::Status {
                        status,
                        result,
                        error_message,
                    } => {
                        saw_terminal = true;
                        if let Err(e) = controller
                            .ingest_terminal(job_id, status, result, error_message)
                            .await
                        {
                            tracing::error!(job_id = %job_id, error = %e, "Terminal update failed");
                        }
                        break;
                    }
                }
            }
            if !saw_terminal && !cancel.is_cancelled() {
                tracing::warn!(
                    job_id = %job_id,
                    worker = %worker.name,
                    "Worker event stream ended without a terminal status"
                );
            }
        });
    }

    async fn queue_log(&self, queue: &Queue, line: &str) {
        let key = queue.id.to_string();
        if let Err(e) = self.logs.append(LogKind::Queue, &key, line).await {
            tracing::error!(queue = %queue.name, error = %e, "Failed to write queue log");
        }
        self.bus.publish_log(LogKind::Queue, key, line);
    }
}

/// Smallest current load, worker id ascending as the tie-break.
fn least_loaded(eligible: &[(Worker, u32)]) -> Worker {
    eligible
        .iter()
        .min_by(|(a, la), (b, lb)| la.cmp(lb).then(a.id.cmp(&b.id)))
        .map(|(w, _)| w.clone())
        .expect("eligible set is non-empty")
}

/// Substitute `{{key}}` placeholders in the spec command with runtime
/// argument values. Unknown placeholders are left as-is.
pub fn render_command(template: &str, args: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match args.get(key) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkerState, WorkerStatus};
    use chrono::Utc;

    fn worker(id: i64, kind: WorkerKind) -> Worker {
        Worker {
            id,
            name: format!("w{id}"),
            kind,
            hostname: None,
            ip_address: Some("127.0.0.1".into()),
            port: 8500,
            ssh_user: None,
            auth_method: None,
            ssh_private_key: None,
            password: None,
            provision: false,
            max_jobs: 10,
            status: WorkerStatus::Online,
            state: WorkerState::Started,
            last_seen: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn least_loaded_breaks_ties_by_id() {
        let eligible = vec![
            (worker(3, WorkerKind::Local), 1),
            (worker(1, WorkerKind::Local), 1),
            (worker(2, WorkerKind::Local), 2),
        ];
        assert_eq!(least_loaded(&eligible).id, 1);
    }

    #[test]
    fn render_substitutes_string_and_number_args() {
        let mut args = serde_json::Map::new();
        args.insert("name".into(), serde_json::Value::String("world".into()));
        args.insert("count".into(), serde_json::json!(3));
        assert_eq!(
            render_command("echo {{name}} x{{count}}", &args),
            "echo world x3"
        );
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let args = serde_json::Map::new();
        assert_eq!(render_command("echo {{missing}}", &args), "echo {{missing}}");
    }

    #[test]
    fn render_handles_unterminated_braces() {
        let args = serde_json::Map::new();
        assert_eq!(render_command("echo {{oops", &args), "echo {{oops");
    }
}

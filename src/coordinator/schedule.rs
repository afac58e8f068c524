//! The long-running service: weekly triggers plus a queue poll.
//!
//! Every trigger is its own task. A stop request is only seen between
//! activations, so a run that has started always finishes first.

use super::{Coordinator, RunOutcome};
use crate::config::ScheduledJob;
use crate::models::PipelineId;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeDelta, Utc, Weekday};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub pipeline: PipelineId,
    pub weekday: Weekday,
    pub at: NaiveTime,
}

impl Trigger {
    pub fn from_job(job: &ScheduledJob) -> Result<Self> {
        let weekday = job
            .weekday
            .trim()
            .parse::<Weekday>()
            .map_err(|_| anyhow!("bad weekday {:?} for {}", job.weekday, job.pipeline))?;
        let at = NaiveTime::parse_from_str(job.at.trim(), "%H:%M")
            .with_context(|| format!("bad time {:?} for {} (want HH:MM)", job.at, job.pipeline))?;
        Ok(Self {
            pipeline: job.pipeline,
            weekday,
            at,
        })
    }

    /// First moment strictly after `now` matching the weekday and time.
    pub fn next_fire(&self, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let offset = *now.offset();
        let ahead = (7 + self.weekday.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64) % 7;
        let local = (now.date_naive() + TimeDelta::days(ahead)).and_time(self.at);
        let mut fire = DateTime::from_naive_utc_and_offset(
            local - TimeDelta::seconds(offset.local_minus_utc() as i64),
            offset,
        );
        if fire <= now {
            fire += TimeDelta::days(7);
        }
        fire
    }
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match sigterm.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Stop requested; waiting for running work to finish");
}

async fn activate(coordinator: &Coordinator, id: PipelineId, out_dir: &Path) {
    match coordinator.run(id, out_dir, None).await {
        Ok(RunOutcome::Completed(summaries)) => {
            for s in summaries {
                info!(
                    "{} done: {} entities, {} rows, {} no data, {} failed, {} suspect ({} after retry) in {:.1?}",
                    id, s.entities, s.rows, s.no_data, s.failures, s.suspects, s.still_suspect, s.elapsed
                );
            }
        }
        Ok(RunOutcome::Skipped) => {}
        Err(e) => error!("{} run failed: {:#}", id, e),
    }
}

fn now_in(offset: FixedOffset) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&offset)
}

fn spawn_trigger(
    coordinator: Arc<Coordinator>,
    trigger: Trigger,
    offset: FixedOffset,
    out_dir: PathBuf,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = now_in(offset);
            let next = trigger.next_fire(now);
            info!("{} next runs at {}", trigger.pipeline, next.format("%a %Y-%m-%d %H:%M %:z"));
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => break,
            }
            activate(&coordinator, trigger.pipeline, &out_dir).await;
            if *stop.borrow() {
                break;
            }
        }
    })
}

fn spawn_queue_poll(
    coordinator: Arc<Coordinator>,
    every: Duration,
    out_dir: PathBuf,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            activate(&coordinator, PipelineId::Sindikasi, &out_dir).await;
            if *stop.borrow() {
                break;
            }
        }
    })
}

/// Run every configured trigger until `shutdown` resolves.
pub async fn serve(coordinator: Arc<Coordinator>, out_dir: PathBuf, shutdown: impl Future<Output = ()>) -> Result<()> {
    let schedule = coordinator.config().schedule.clone();
    let triggers = schedule
        .jobs
        .iter()
        .map(Trigger::from_job)
        .collect::<Result<Vec<_>>>()?;
    let offset = FixedOffset::east_opt(schedule.utc_offset_hours * 3600)
        .with_context(|| format!("bad UTC offset {}", schedule.utc_offset_hours))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for trigger in triggers {
        handles.push(spawn_trigger(
            coordinator.clone(),
            trigger,
            offset,
            out_dir.clone(),
            stop_rx.clone(),
        ));
    }
    if schedule.queue_poll_secs > 0 {
        info!("Polling {:?} every {}s", coordinator.config().sindikasi.queue_dir, schedule.queue_poll_secs);
        handles.push(spawn_queue_poll(
            coordinator.clone(),
            Duration::from_secs(schedule.queue_poll_secs),
            out_dir.clone(),
            stop_rx,
        ));
    } else {
        warn!("Queue polling disabled");
    }

    shutdown.await;
    let _ = stop_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }
    info!("Scheduler stopped");
    Ok(())
}

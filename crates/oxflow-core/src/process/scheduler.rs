//! Schedule polling: cron and interval triggers with catch-up.
//!
//! The poller is stateless between ticks; `last_fired_at` in the repository
//! is the only clock it trusts, so a restarted engine picks up where the
//! previous one stopped. Each fire starts the schedule's run through the
//! normal `start()` path with a deterministic idempotency key, which makes
//! replays after a crash harmless and lets the definition's overlap policy
//! govern concurrent fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use oxflow_types::process::ScheduleState;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use super::engine::{EngineError, EngineInner};
use super::registry::{ScheduleSpec, normalize_cron};
use crate::repository::process::ProcessRepository;

/// Cap on fires replayed in a single catch-up pass. A schedule that has
/// been down for longer than this many occurrences resumes from the cap.
const MAX_CATCH_UP_FIRES: usize = 256;

/// Periodic schedule poller. Cheap to clone; shares the engine's state.
pub struct Scheduler<R: ProcessRepository> {
    inner: Arc<EngineInner<R>>,
    poll_interval: Duration,
}

impl<R: ProcessRepository> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), poll_interval: self.poll_interval }
    }
}

impl<R: ProcessRepository> Scheduler<R> {
    pub(crate) fn new(inner: Arc<EngineInner<R>>, poll_interval: Duration) -> Self {
        Self { inner, poll_interval }
    }

    /// Poll until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Err(error) = self.poll_once(Utc::now()).await {
                tracing::error!(%error, "schedule poll failed");
            }
        }
    }

    /// One pass over every registered schedule. Returns the number of runs
    /// started.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut started = 0;

        for process in self.inner.registry.schedules() {
            let Some(spec) = process.schedule.as_ref() else {
                continue;
            };

            let state = self.inner.repo.get_schedule_state(&process.name).await?;
            let Some(baseline) = state.and_then(|s| s.last_fired_at) else {
                // First observation: record the baseline and fire nothing
                // retroactively. The next due occurrence fires normally.
                self.inner
                    .repo
                    .upsert_schedule_state(&ScheduleState {
                        schedule: process.name.clone(),
                        last_fired_at: Some(now),
                    })
                    .await?;
                tracing::info!(schedule = %process.name, "schedule baseline recorded");
                continue;
            };

            let mut due = Vec::new();
            let mut last = baseline;
            while let Some(next) = next_fire(spec, last) {
                if next > now {
                    break;
                }
                due.push(next);
                last = next;
                if due.len() >= MAX_CATCH_UP_FIRES {
                    break;
                }
            }
            if due.is_empty() {
                continue;
            }

            // Without catch-up, missed occurrences collapse into the most
            // recent one.
            if !spec.catch_up && due.len() > 1 {
                tracing::warn!(
                    schedule = %process.name,
                    skipped = due.len() - 1,
                    "collapsing missed fires (catch_up disabled)"
                );
                due.drain(..due.len() - 1);
            }

            for fire_time in &due {
                let key = format!("{}@{}", process.name, fire_time.to_rfc3339());
                match self
                    .inner
                    .prepare_start(&process.name, Map::new(), Some(&key))
                    .await
                {
                    Ok((run_id, spawn)) => {
                        if let Some(spawned) = spawn {
                            tracing::info!(
                                schedule = %process.name,
                                run_id = %run_id,
                                fire_time = %fire_time,
                                "schedule fired"
                            );
                            self.inner.spawn_run(run_id, &spawned);
                        }
                        started += 1;
                    }
                    Err(error) => {
                        tracing::error!(schedule = %process.name, %error, "schedule fire failed");
                    }
                }
            }

            self.inner
                .repo
                .upsert_schedule_state(&ScheduleState {
                    schedule: process.name.clone(),
                    last_fired_at: Some(last),
                })
                .await?;
        }

        Ok(started)
    }
}

// ---------------------------------------------------------------------------
// Fire-time computation
// ---------------------------------------------------------------------------

/// Next occurrence strictly after `after`, in UTC.
pub fn next_fire(spec: &ScheduleSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(interval) = spec.interval_secs {
        return Some(after + chrono::Duration::seconds(interval as i64));
    }

    let cron_expr = spec.cron.as_deref()?;
    let cron: croner::Cron = normalize_cron(cron_expr)?.parse().ok()?;
    let offset = parse_offset(spec.timezone.as_deref());
    cron.iter_after(after.with_timezone(&offset))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse a fixed-offset timezone of the form `+HH:MM` / `-HH:MM` (or
/// `UTC`). Anything unrecognized falls back to UTC with a warning.
fn parse_offset(timezone: Option<&str>) -> FixedOffset {
    let Some(raw) = timezone else {
        return Utc.fix();
    };
    if raw.eq_ignore_ascii_case("utc") {
        return Utc.fix();
    }

    let parsed = (|| {
        let (sign, rest) = match raw.split_at_checked(1)? {
            ("+", rest) => (1, rest),
            ("-", rest) => (-1, rest),
            _ => return None,
        };
        let (hours, minutes) = rest.split_once(':')?;
        let hours: i32 = hours.parse().ok()?;
        let minutes: i32 = minutes.parse().ok()?;
        if hours > 23 || minutes > 59 {
            return None;
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
    })();

    match parsed {
        Some(offset) => offset,
        None => {
            tracing::warn!(timezone = raw, "unrecognized timezone, falling back to UTC");
            Utc.fix()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::engine::ProcessEngine;
    use crate::repository::memory::MemoryRepository;
    use oxflow_types::process::{RunStatus, ScheduleDefinition};
    use serde_json::{Value, json};

    fn spec_cron(cron: &str, timezone: Option<&str>) -> ScheduleSpec {
        ScheduleSpec {
            cron: Some(cron.into()),
            interval_secs: None,
            timezone: timezone.map(Into::into),
            catch_up: false,
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    // -------------------------------------------------------------------
    // next_fire
    // -------------------------------------------------------------------

    #[test]
    fn interval_fires_at_fixed_spacing() {
        let spec = ScheduleSpec {
            cron: None,
            interval_secs: Some(900),
            timezone: None,
            catch_up: false,
        };
        let after = utc("2026-08-25T10:00:00Z");
        assert_eq!(next_fire(&spec, after).unwrap(), utc("2026-08-25T10:15:00Z"));
    }

    #[test]
    fn daily_cron_fires_next_day_once_past() {
        let spec = spec_cron("0 2 * * *", None);
        assert_eq!(
            next_fire(&spec, utc("2026-08-25T01:00:00Z")).unwrap(),
            utc("2026-08-25T02:00:00Z")
        );
        assert_eq!(
            next_fire(&spec, utc("2026-08-25T02:00:00Z")).unwrap(),
            utc("2026-08-26T02:00:00Z")
        );
    }

    #[test]
    fn cron_respects_fixed_offset_timezone() {
        // 02:00 at +05:30 is 20:30 UTC the previous day
        let spec = spec_cron("0 2 * * *", Some("+05:30"));
        assert_eq!(
            next_fire(&spec, utc("2026-08-25T10:00:00Z")).unwrap(),
            utc("2026-08-25T20:30:00Z")
        );
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let spec = spec_cron("0 2 * * *", Some("Mars/Olympus"));
        assert_eq!(
            next_fire(&spec, utc("2026-08-25T01:00:00Z")).unwrap(),
            utc("2026-08-25T02:00:00Z")
        );
    }

    #[test]
    fn six_field_cron_with_seconds() {
        let spec = spec_cron("30 * * * * *", None);
        assert_eq!(
            next_fire(&spec, utc("2026-08-25T10:00:00Z")).unwrap(),
            utc("2026-08-25T10:00:30Z")
        );
    }

    // -------------------------------------------------------------------
    // poll_once
    // -------------------------------------------------------------------

    fn engine_with_interval_schedule(
        interval_secs: u64,
        catch_up: bool,
    ) -> (ProcessEngine<MemoryRepository>, MemoryRepository) {
        let repo = MemoryRepository::new();
        let engine = ProcessEngine::new(repo.clone());
        engine.handlers().register("reports.generate", |_| async {
            Ok::<Value, _>(json!({ "ok": true }))
        });

        let yaml = format!(
            r#"
name: report-schedule
trigger:
  interval_secs: {interval_secs}
  catch_up: {catch_up}
steps:
  - name: generate
    kind: service
    service: reports.generate
"#
        );
        let def: ScheduleDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        engine.register(def).unwrap();
        (engine, repo)
    }

    async fn seed_baseline(repo: &MemoryRepository, schedule: &str, at: DateTime<Utc>) {
        repo.upsert_schedule_state(&ScheduleState {
            schedule: schedule.into(),
            last_fired_at: Some(at),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_poll_records_baseline_without_firing() {
        let (engine, repo) = engine_with_interval_schedule(60, true);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 0);

        let state = repo.get_schedule_state("report-schedule").await.unwrap().unwrap();
        assert_eq!(state.last_fired_at, Some(now));
        assert!(engine.list_runs(&Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn catch_up_replays_every_missed_fire() {
        let (engine, repo) = engine_with_interval_schedule(60, true);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        seed_baseline(&repo, "report-schedule", now - chrono::Duration::seconds(210)).await;

        // 210s behind at 60s spacing means 3 missed fires
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 3);

        let state = repo.get_schedule_state("report-schedule").await.unwrap().unwrap();
        let remainder = now - state.last_fired_at.unwrap();
        assert!(remainder.num_seconds() < 60);
    }

    #[tokio::test]
    async fn without_catch_up_only_latest_fire_runs() {
        let (engine, repo) = engine_with_interval_schedule(60, false);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        seed_baseline(&repo, "report-schedule", now - chrono::Duration::seconds(210)).await;

        assert_eq!(scheduler.poll_once(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replayed_fires_deduplicate_by_fire_time() {
        let (engine, repo) = engine_with_interval_schedule(60, true);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        let baseline = now - chrono::Duration::seconds(90);
        seed_baseline(&repo, "report-schedule", baseline).await;
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 1);

        // Re-seed to the same baseline, simulating a crash before the
        // state write; the fire replays but dedups to the same run.
        let runs_before = engine.list_runs(&Default::default()).await.unwrap();
        seed_baseline(&repo, "report-schedule", baseline).await;
        scheduler.poll_once(now).await.unwrap();
        let runs_after = engine.list_runs(&Default::default()).await.unwrap();
        assert_eq!(runs_before.len(), runs_after.len());
    }

    #[tokio::test]
    async fn nothing_due_fires_nothing() {
        let (engine, repo) = engine_with_interval_schedule(3600, true);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        seed_baseline(&repo, "report-schedule", now - chrono::Duration::seconds(30)).await;
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fired_run_executes_to_completion() {
        let (engine, repo) = engine_with_interval_schedule(60, true);
        let scheduler = engine.scheduler(Duration::from_secs(1));

        let now = Utc::now();
        seed_baseline(&repo, "report-schedule", now - chrono::Duration::seconds(61)).await;
        assert_eq!(scheduler.poll_once(now).await.unwrap(), 1);

        let runs = engine.list_runs(&Default::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        for _ in 0..200 {
            let run = engine.get_run(runs[0].id).await.unwrap();
            if run.status == RunStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduled run never completed");
    }
}

// Weft Engine — Cron Scheduler
//
// Five-field cron (minute hour day-of-month month day-of-week) with names
// (JAN…, SUN…), ranges, lists, and steps. Next-run search walks forward one
// minute at a time in the job's timezone, bounded at one year; a fruitless
// search falls back to now + 1h and logs. One tick loop checks every job
// once a minute (plus one immediate tick at start); per-job timers are
// deliberately avoided.
//
// Job failures are caught and logged; the job stays scheduled and its
// `next_run` always lands strictly in the future after a fire.

use crate::atoms::constants::{CRON_MAX_LIST_SIZE, CRON_SEARCH_LIMIT_MINUTES, SCHEDULER_TICK_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::context::{ActionContext, SyntheticEvent};
use crate::engine::flow::FlowEngine;
use crate::engine::spec::JobSpec;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ── Cron parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    /// Sorted allowed values.
    Values(Vec<u32>),
}

impl CronField {
    pub fn matches(&self, v: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.binary_search(&v).is_ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronSpec {
    pub minute: CronField,
    pub hour: CronField,
    pub dom: CronField,
    pub month: CronField,
    pub dow: CronField,
}

fn name_to_number(token: &str, names: &[&str], base: u32) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    names.iter().position(|n| *n == lower).map(|i| i as u32 + base)
}

const MONTHS: &[&str] =
    &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
const DAYS: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Parse one atom (integer or name) for a field.
fn parse_atom(token: &str, field: usize) -> EngineResult<u32> {
    if let Ok(n) = token.parse::<u32>() {
        // Day-of-week 7 is Sunday.
        return Ok(if field == 4 && n == 7 { 0 } else { n });
    }
    let named = match field {
        3 => name_to_number(token, MONTHS, 1),
        4 => name_to_number(token, DAYS, 0),
        _ => None,
    };
    named.ok_or_else(|| EngineError::normalization(format!("bad cron atom '{token}'")))
}

fn field_bounds(field: usize) -> (u32, u32) {
    match field {
        0 => (0, 59),
        1 => (0, 23),
        2 => (1, 31),
        3 => (1, 12),
        _ => (0, 6),
    }
}

fn parse_field(text: &str, field: usize) -> EngineResult<CronField> {
    let (lo, hi) = field_bounds(field);
    if text == "*" {
        return Ok(CronField::Any);
    }

    let mut values: Vec<u32> = Vec::new();
    for part in text.split(',') {
        if let Some(step_text) = part.strip_prefix("*/") {
            let step: u32 = step_text
                .parse()
                .map_err(|_| EngineError::normalization(format!("bad cron step '{part}'")))?;
            if step == 0 {
                return Err(EngineError::normalization("cron step of 0"));
            }
            values.extend((lo..=hi).step_by(step as usize));
        } else if let Some((a, b)) = part.split_once('-') {
            let from = parse_atom(a, field)?;
            let to = parse_atom(b, field)?;
            if to < from {
                return Err(EngineError::normalization(format!("inverted cron range '{part}'")));
            }
            // Reject absurd expansions before generating them.
            if (to - from) as usize + 1 > CRON_MAX_LIST_SIZE {
                return Err(EngineError::normalization(format!(
                    "cron range '{part}' expands to more than {CRON_MAX_LIST_SIZE} values"
                )));
            }
            values.extend(from..=to);
        } else if let Some((start, step)) = part.split_once('/') {
            let from = parse_atom(start, field)?;
            let step: u32 = step
                .parse()
                .map_err(|_| EngineError::normalization(format!("bad cron step '{part}'")))?;
            if step == 0 {
                return Err(EngineError::normalization("cron step of 0"));
            }
            values.extend((from..=hi).step_by(step as usize));
        } else {
            values.push(parse_atom(part, field)?);
        }
    }

    if values.len() > CRON_MAX_LIST_SIZE {
        return Err(EngineError::normalization(format!(
            "cron field '{text}' lists more than {CRON_MAX_LIST_SIZE} values"
        )));
    }
    for v in &values {
        if *v < lo || *v > hi {
            return Err(EngineError::normalization(format!(
                "cron value {v} out of range {lo}-{hi}"
            )));
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

/// Parse a five-field cron expression.
pub fn parse_cron(expr: &str) -> EngineResult<CronSpec> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(EngineError::normalization(format!(
            "cron '{expr}' must have 5 fields, found {}",
            fields.len()
        )));
    }
    Ok(CronSpec {
        minute: parse_field(fields[0], 0)?,
        hour: parse_field(fields[1], 1)?,
        dom: parse_field(fields[2], 2)?,
        month: parse_field(fields[3], 3)?,
        dow: parse_field(fields[4], 4)?,
    })
}

impl CronSpec {
    fn matches_local(&self, dt: &DateTime<Tz>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.dom.matches(dt.day())
            && self.month.matches(dt.month())
            && self.dow.matches(dt.weekday().num_days_from_sunday())
    }

    /// First instant strictly after `from` that matches, respecting the
    /// timezone. Falls back to `from + 1h` when a year-long walk finds
    /// nothing.
    pub fn next_run(&self, from: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let mut candidate = from
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(from)
            + ChronoDuration::minutes(1);
        for _ in 0..CRON_SEARCH_LIMIT_MINUTES {
            if self.matches_local(&candidate.with_timezone(&tz)) {
                return candidate;
            }
            candidate += ChronoDuration::minutes(1);
        }
        log::warn!("[scheduler] No matching instant within a year, falling back to +1h");
        from + ChronoDuration::hours(1)
    }
}

// ── The scheduler ──────────────────────────────────────────────────────────

struct RegisteredJob {
    spec: JobSpec,
    cron: CronSpec,
    tz: Tz,
    next_run: DateTime<Utc>,
}

pub struct CronScheduler {
    jobs: Mutex<Vec<RegisteredJob>>,
    default_tz: Tz,
    stop: Arc<AtomicBool>,
}

impl CronScheduler {
    pub fn new(default_tz_name: &str) -> Self {
        let default_tz = default_tz_name.parse::<Tz>().unwrap_or_else(|_| {
            log::warn!("[scheduler] Unknown timezone '{default_tz_name}', using UTC");
            Tz::UTC
        });
        CronScheduler { jobs: Mutex::new(Vec::new()), default_tz, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Replace the job table. Jobs with unparseable cron specs are logged
    /// and skipped, never registered half-working.
    pub fn register_jobs(&self, specs: &[JobSpec]) {
        let now = Utc::now();
        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            let cron = match parse_cron(&spec.cron) {
                Ok(c) => c,
                Err(e) => {
                    log::error!("[scheduler] Job '{}' rejected: {e}", spec.name);
                    continue;
                }
            };
            let tz = spec
                .timezone
                .as_deref()
                .and_then(|name| name.parse::<Tz>().ok())
                .unwrap_or(self.default_tz);
            let next_run = cron.next_run(now, tz);
            log::info!("[scheduler] Job '{}' next run {next_run}", spec.name);
            jobs.push(RegisteredJob { spec: spec.clone(), cron, tz, next_run });
        }
        *self.jobs.lock() = jobs;
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Next scheduled run for a job, if registered.
    pub fn next_run_of(&self, name: &str) -> Option<DateTime<Utc>> {
        self.jobs.lock().iter().find(|j| j.spec.name == name).map(|j| j.next_run)
    }

    /// One scheduler pass at `now`: run every enabled, due job in table
    /// order (sequentially), then advance its `next_run` strictly past now.
    /// Handler failures are caught; the job stays scheduled.
    pub async fn tick_at(&self, now: DateTime<Utc>, flow: &FlowEngine, base_ctx: &ActionContext) {
        let due: Vec<(String, Vec<crate::engine::spec::Action>, Option<String>)> = {
            let mut jobs = self.jobs.lock();
            let mut due = Vec::new();
            for job in jobs.iter_mut() {
                if !job.spec.enabled || job.next_run > now {
                    continue;
                }
                due.push((job.spec.name.clone(), job.spec.actions.clone(), job.spec.when.clone()));
                job.next_run = job.cron.next_run(now, job.tz);
            }
            due
        };

        if !due.is_empty() {
            let _ = flow.executor.events_tx.send(SyntheticEvent {
                name: "scheduler_tick".into(),
                data: json!({"at": now.timestamp_millis()}),
            });
        }

        for (name, actions, when) in due {
            let mut ctx = base_ctx.clone();
            ctx.set("job", json!({"name": name}));
            if let Some(when) = &when {
                if !flow.guard_passes(when, &ctx).await {
                    log::debug!("[scheduler] Job '{name}' skipped by guard");
                    continue;
                }
            }
            log::info!("[scheduler] Running job '{name}'");
            let results = flow.run_actions(&actions, &mut ctx).await;
            let failures = results.iter().filter(|r| !r.success).count();
            if failures > 0 {
                log::error!("[scheduler] Job '{name}': {failures} action(s) failed");
            }
        }
    }

    /// Start the tick loop: one immediate check, then every 60 s until
    /// `stop`. Registrations survive stop.
    pub fn start(self: Arc<Self>, flow: Arc<FlowEngine>, base_ctx: ActionContext) {
        self.stop.store(false, Ordering::Relaxed);
        let scheduler = self;
        tokio::spawn(async move {
            log::info!("[scheduler] Started ({} job(s), {SCHEDULER_TICK_SECS}s tick)", scheduler.job_count());
            loop {
                if scheduler.stop.load(Ordering::Relaxed) {
                    break;
                }
                scheduler.tick_at(Utc::now(), &flow, &base_ctx).await;
                tokio::time::sleep(std::time::Duration::from_secs(SCHEDULER_TICK_SECS)).await;
            }
            log::info!("[scheduler] Stopped");
        });
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builders::TemplateRegistry;
    use crate::engine::client::NullClient;
    use crate::engine::executor::Executor;
    use crate::engine::spec::parse_spec;
    use crate::engine::state::StateManager;
    use crate::engine::storage::memory::MemoryStorage;
    use crate::engine::timers::TimerManager;
    use crate::engine::voice::{NullVoiceBackend, VoiceManager};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_basic_forms() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("*/15 0 1 jan mon").is_ok());
        assert!(parse_cron("0,30 9-17 * * 1-5").is_ok());
        assert!(parse_cron("5/10 * * * *").is_ok());
        assert!(parse_cron("bad").is_err());
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("* * * * * *").is_err());
        assert!(parse_cron("*/0 * * * *").is_err());
    }

    #[test]
    fn names_are_case_insensitive_and_sunday_is_seven() {
        let spec = parse_cron("0 0 * JAN SUN").unwrap();
        assert_eq!(spec.month, CronField::Values(vec![1]));
        assert_eq!(spec.dow, CronField::Values(vec![0]));
        let spec = parse_cron("0 0 * * 7").unwrap();
        assert_eq!(spec.dow, CronField::Values(vec![0]));
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        // The 0-99999 defense: rejected, not expanded.
        assert!(parse_cron("0-99999 * * * *").is_err());
    }

    #[test]
    fn next_run_every_fifteen() {
        let spec = parse_cron("*/15 * * * *").unwrap();
        let next = spec.next_run(utc("2025-01-01T00:03:00Z"), Tz::UTC);
        assert_eq!(next, utc("2025-01-01T00:15:00Z"));
        // From an exact match instant, the next run is strictly later.
        let next = spec.next_run(utc("2025-01-01T00:15:00Z"), Tz::UTC);
        assert_eq!(next, utc("2025-01-01T00:30:00Z"));
    }

    #[test]
    fn next_run_daily_at_hour() {
        let spec = parse_cron("0 9 * * *").unwrap();
        let next = spec.next_run(utc("2025-03-10T10:30:00Z"), Tz::UTC);
        assert_eq!(next, utc("2025-03-11T09:00:00Z"));
    }

    #[test]
    fn next_run_respects_timezone() {
        // 09:00 in Berlin (winter, UTC+1) is 08:00 UTC.
        let spec = parse_cron("0 9 * * *").unwrap();
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let next = spec.next_run(utc("2025-01-15T00:00:00Z"), tz);
        assert_eq!(next, utc("2025-01-15T08:00:00Z"));
    }

    #[test]
    fn next_run_weekday_filter() {
        // Monday 2025-01-06; from a Saturday the next weekday hit is Monday.
        let spec = parse_cron("0 12 * * 1-5").unwrap();
        let next = spec.next_run(utc("2025-01-04T00:00:00Z"), Tz::UTC);
        assert_eq!(next, utc("2025-01-06T12:00:00Z"));
    }

    fn flow_engine() -> (FlowEngine, Arc<NullClient>) {
        let doc = parse_spec("{}").unwrap();
        let client = Arc::new(NullClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let (events_tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = Arc::new(Executor {
            client: client.clone(),
            storage: storage.clone(),
            state: Arc::new(StateManager::new(storage, &doc.state)),
            voice: Arc::new(VoiceManager::new(Arc::new(NullVoiceBackend::default()), 100, 100)),
            timers: Arc::new(TimerManager::new(events_tx.clone())),
            templates: Arc::new(TemplateRegistry::from_spec(&doc.components)),
            events_tx,
        });
        (FlowEngine::new(executor, doc.engine.clone()), client)
    }

    fn jobs(yaml: &str) -> Vec<JobSpec> {
        parse_spec(yaml).unwrap().scheduler.jobs
    }

    #[tokio::test]
    async fn due_jobs_fire_and_advance() {
        let (flow, client) = flow_engine();
        let scheduler = CronScheduler::new("UTC");
        scheduler.register_jobs(&jobs(
            r#"
scheduler:
  jobs:
    - name: minutely
      cron: "* * * * *"
      actions: [{send_message: {channel: c, content: "tick ${job.name}"}}]
"#,
        ));
        // Force the job due, then tick.
        let now = Utc::now() + ChronoDuration::minutes(2);
        scheduler.tick_at(now, &flow, &ActionContext::empty()).await;
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args["msg"]["content"], serde_json::json!("tick minutely"));
        // next_run advanced strictly past the tick instant.
        let next = scheduler.next_run_of("minutely").unwrap();
        assert!(next > now);
        // Immediately ticking again at the same instant does nothing.
        scheduler.tick_at(now, &flow, &ActionContext::empty()).await;
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn disabled_jobs_and_failing_guards_do_not_fire() {
        let (flow, client) = flow_engine();
        let scheduler = CronScheduler::new("UTC");
        scheduler.register_jobs(&jobs(
            r#"
scheduler:
  jobs:
    - name: off
      cron: "* * * * *"
      enabled: false
      actions: [{send_message: {channel: c, content: "off"}}]
    - name: guarded
      cron: "* * * * *"
      when: "false"
      actions: [{send_message: {channel: c, content: "guarded"}}]
"#,
        ));
        let now = Utc::now() + ChronoDuration::minutes(2);
        scheduler.tick_at(now, &flow, &ActionContext::empty()).await;
        assert!(client.calls_named("send_message").is_empty());
    }

    #[tokio::test]
    async fn failing_job_stays_scheduled() {
        let (flow, _) = flow_engine();
        let scheduler = CronScheduler::new("UTC");
        scheduler.register_jobs(&jobs(
            r#"
scheduler:
  jobs:
    - name: broken
      cron: "* * * * *"
      actions: [{kick: {}}]
"#,
        ));
        let now = Utc::now() + ChronoDuration::minutes(2);
        scheduler.tick_at(now, &flow, &ActionContext::empty()).await;
        assert_eq!(scheduler.job_count(), 1);
        assert!(scheduler.next_run_of("broken").unwrap() > now);
    }

    #[test]
    fn invalid_cron_jobs_are_skipped_at_registration() {
        let scheduler = CronScheduler::new("UTC");
        scheduler.register_jobs(&jobs(
            r#"
scheduler:
  jobs:
    - name: bad
      cron: "not a cron"
      actions: []
    - name: good
      cron: "0 * * * *"
      actions: []
"#,
        ));
        assert_eq!(scheduler.job_count(), 1);
    }
}

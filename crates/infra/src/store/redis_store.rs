//! Redis-backed job store.
//!
//! Each state transition is one Lua script, so it is atomic on the server.
//!
//! ## Key layout
//!
//! - `taskmill:{queue}:wait`       list of waiting ids (FIFO)
//! - `taskmill:{queue}:active`     list of active ids
//! - `taskmill:{queue}:delayed`    zset, score = due time (ms)
//! - `taskmill:{queue}:completed`  zset, score = finish time (ms)
//! - `taskmill:{queue}:failed`     zset, score = finish time (ms)
//! - `taskmill:{queue}:marker`     list popped by blocked workers on new work
//! - `taskmill:{queue}:limiter`    fetch counter for the rate limit window
//! - `taskmill:{queue}:job:{id}`   job hash; `:lock` (token, PX) and `:logs` beside it

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use taskmill_core::{Job, JobFailure, JobId, JobLock, JobOptions, JobState, LockToken, RetryDecision, to_chrono};

use super::{
    FailedTransition, JobCounts, JobStore, NextJob, RateLimit, STALLED_REASON, StalledReport, StoreError,
    StoreResult,
};

const KEY_ROOT: &str = "taskmill";

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        StoreError::Communication(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Invalid(value.to_string())
    }
}

struct Scripts {
    add: Script,
    fetch_next: Script,
    extend_lock: Script,
    complete: Script,
    fail: Script,
    delay: Script,
    stalled: Script,
    set_field: Script,
    add_log: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add: Script::new(include_str!("lua/add.lua")),
            fetch_next: Script::new(include_str!("lua/fetch_next.lua")),
            extend_lock: Script::new(include_str!("lua/extend_lock.lua")),
            complete: Script::new(include_str!("lua/complete.lua")),
            fail: Script::new(include_str!("lua/fail.lua")),
            delay: Script::new(include_str!("lua/delay.lua")),
            stalled: Script::new(include_str!("lua/stalled.lua")),
            set_field: Script::new(include_str!("lua/set_field.lua")),
            add_log: Script::new(include_str!("lua/add_log.lua")),
        }
    }
}

#[derive(Debug, Clone)]
struct Keys {
    base: String,
}

impl Keys {
    fn new(queue: &str) -> Self {
        Self {
            base: format!("{KEY_ROOT}:{queue}"),
        }
    }

    fn list(&self, name: &str) -> String {
        format!("{}:{name}", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{id}", self.base)
    }

    fn lock(&self, id: &JobId) -> String {
        format!("{}:job:{id}:lock", self.base)
    }

    fn logs(&self, id: &JobId) -> String {
        format!("{}:job:{id}:logs", self.base)
    }
}

/// [`JobStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    conn: ConnectionManager,
    /// Dedicated connection for `BLPOP` so blocking never stalls other calls.
    blocking: Arc<Mutex<Option<MultiplexedConnection>>>,
    keys: Keys,
    scripts: Arc<Scripts>,
    rate_limit: Option<RateLimit>,
}

impl RedisJobStore {
    /// Connect to `redis_url` and serve the queue named `queue`.
    ///
    /// ```ignore
    /// let store = RedisJobStore::connect("redis://localhost:6379", "emails").await?;
    /// ```
    pub async fn connect(redis_url: impl AsRef<str>, queue: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(None)),
            keys: Keys::new(queue),
            scripts: Arc::new(Scripts::load()),
            rate_limit: None,
        })
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let lock_key = self.keys.lock(job_id);

        let (fields, logs, token, ttl_ms): (HashMap<String, String>, Vec<String>, Option<String>, i64) =
            redis::pipe()
                .cmd("HGETALL")
                .arg(self.keys.job(job_id))
                .cmd("LRANGE")
                .arg(self.keys.logs(job_id))
                .arg(0)
                .arg(-1)
                .cmd("GET")
                .arg(&lock_key)
                .cmd("PTTL")
                .arg(&lock_key)
                .query_async(&mut conn)
                .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let mut job = job_from_fields(job_id, &fields)?;
        job.logs = logs;
        if let Some(token) = token {
            let expires_at = Utc::now() + chrono::Duration::milliseconds(ttl_ms.max(0));
            job.lock = Some(JobLock {
                token: token.parse()?,
                expires_at,
            });
        }
        Ok(Some(job))
    }
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn job_fields(job: &Job) -> StoreResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("name", job.name.clone()),
        ("data", serde_json::to_string(&job.data)?),
        ("opts", serde_json::to_string(&job.opts)?),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("stalled_counter", job.stalled_counter.to_string()),
        ("progress", serde_json::to_string(&job.progress)?),
        ("created_at", job.created_at.to_rfc3339()),
    ];
    if let Some(at) = job.delayed_until {
        fields.push(("delayed_until", at.to_rfc3339()));
    }
    Ok(fields)
}

fn job_from_fields(id: &JobId, fields: &HashMap<String, String>) -> StoreResult<Job> {
    let required = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Invalid(format!("job {id} has no '{name}' field")))
    };
    let json = |name: &str| -> StoreResult<Option<Value>> {
        fields
            .get(name)
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(StoreError::from)
    };
    let time = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        fields
            .get(name)
            .map(|raw| DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| StoreError::Invalid(format!("job {id} field '{name}': {e}")))
    };
    let number = |name: &str| -> StoreResult<u32> {
        fields
            .get(name)
            .map(|raw| raw.parse::<u32>())
            .transpose()
            .map(|n| n.unwrap_or(0))
            .map_err(|e| StoreError::Invalid(format!("job {id} field '{name}': {e}")))
    };

    let state: JobState = serde_json::from_value(Value::String(required("state")?.clone()))?;
    let opts: JobOptions = serde_json::from_str(required("opts")?)?;

    Ok(Job {
        id: id.clone(),
        name: required("name")?.clone(),
        data: json("data")?.unwrap_or(Value::Null),
        opts,
        state,
        attempts_made: number("attempts_made")?,
        stalled_counter: number("stalled_counter")?,
        lock: None,
        progress: json("progress")?.unwrap_or(Value::Null),
        return_value: json("return_value")?,
        failed_reason: fields.get("failed_reason").cloned(),
        logs: Vec::new(),
        created_at: time("created_at")?.unwrap_or_else(Utc::now),
        processed_on: time("processed_on")?,
        finished_on: time("finished_on")?,
        delayed_until: time("delayed_until")?,
    })
}

/// Map the `-1 / 0 / 1` convention of the transition scripts.
fn check_owned(code: i64, job_id: &JobId) -> StoreResult<()> {
    match code {
        1 => Ok(()),
        0 => Err(StoreError::LockMismatch(job_id.clone())),
        _ => Err(StoreError::NotFound(job_id.clone())),
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, data, opts))]
    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> StoreResult<Job> {
        let job = Job::new(name, data, opts, Utc::now())?;
        let mut conn = self.conn.clone();

        let mut invocation = self.scripts.add.prepare_invoke();
        invocation
            .key(self.keys.job(&job.id))
            .key(self.keys.list("wait"))
            .key(self.keys.list("delayed"))
            .key(self.keys.list("marker"))
            .arg(job.id.as_str())
            .arg(job.delayed_until.map(ms).unwrap_or(0));
        for (field, value) in job_fields(&job)? {
            invocation.arg(field).arg(value);
        }

        let created: i64 = invocation.invoke_async(&mut conn).await?;
        if created == 0 {
            return Err(StoreError::AlreadyExists(job.id));
        }

        debug!(job_id = %job.id, state = %job.state, "job added");
        Ok(job)
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        self.load(job_id).await
    }

    #[instrument(skip(self, token), fields(token = %token))]
    async fn fetch_next_job(&self, token: &LockToken, lock_duration: Duration) -> StoreResult<NextJob> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let (limit_max, limit_window) = self
            .rate_limit
            .map(|l| (l.max, l.duration.as_millis() as u64))
            .unwrap_or((0, 0));

        let reply: Vec<String> = self
            .scripts
            .fetch_next
            .key(self.keys.list("wait"))
            .key(self.keys.list("active"))
            .key(self.keys.list("delayed"))
            .key(self.keys.list("limiter"))
            .key(self.keys.job_prefix())
            .arg(token.to_string())
            .arg(lock_duration.as_millis() as u64)
            .arg(ms(now))
            .arg(now.to_rfc3339())
            .arg(limit_max)
            .arg(limit_window)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("job") if reply.len() >= 2 => {
                let id = JobId::from(reply[1].as_str());
                let fields: HashMap<String, String> = reply[2..]
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                let mut job = job_from_fields(&id, &fields)?;
                job.lock = Some(JobLock {
                    token: token.clone(),
                    expires_at: now + to_chrono(lock_duration),
                });
                Ok(NextJob::Job(Box::new(job)))
            }
            Some("limited") => {
                let ttl: u64 = reply
                    .get(1)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                Ok(NextJob::RateLimited {
                    retry_after: Duration::from_millis(ttl),
                })
            }
            _ => Ok(NextJob::Empty),
        }
    }

    async fn extend_lock(&self, job_id: &JobId, token: &LockToken, lock_duration: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .scripts
            .extend_lock
            .key(self.keys.lock(job_id))
            .arg(token.to_string())
            .arg(lock_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            Ok(())
        } else {
            Err(StoreError::LockMismatch(job_id.clone()))
        }
    }

    #[instrument(skip(self, job_id, result), fields(job_id = %job_id))]
    async fn mark_completed(&self, job_id: &JobId, token: &LockToken, result: Value) -> StoreResult<()> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .complete
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.list("active"))
            .key(self.keys.list("completed"))
            .arg(token.to_string())
            .arg(job_id.as_str())
            .arg(serde_json::to_string(&result)?)
            .arg(now.to_rfc3339())
            .arg(ms(now))
            .invoke_async(&mut conn)
            .await?;

        check_owned(code, job_id)
    }

    #[instrument(skip(self, job_id, failure), fields(job_id = %job_id, kind = ?failure.kind))]
    async fn mark_failed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        failure: &JobFailure,
    ) -> StoreResult<FailedTransition> {
        // Attempts and options only change through a fetch, which replaces the
        // lock token; the script re-checks both before applying the decision.
        let job = self
            .load(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        if !job.lock.as_ref().is_some_and(|lock| &lock.token == token) {
            return Err(StoreError::LockMismatch(job_id.clone()));
        }

        let now = Utc::now();
        let (target, transition) = match job.retry_decision(failure, now) {
            RetryDecision::Retry => ("wait", FailedTransition::Retrying),
            RetryDecision::Delay(until) => ("delayed", FailedTransition::Delayed { until }),
            RetryDecision::Fail => ("failed", FailedTransition::Failed),
        };
        let until = match transition {
            FailedTransition::Delayed { until } => until,
            _ => now,
        };

        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .fail
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.list("active"))
            .key(self.keys.list("wait"))
            .key(self.keys.list("delayed"))
            .key(self.keys.list("failed"))
            .key(self.keys.list("marker"))
            .arg(token.to_string())
            .arg(job_id.as_str())
            .arg(&failure.message)
            .arg(now.to_rfc3339())
            .arg(ms(now))
            .arg(target)
            .arg(ms(until))
            .arg(until.to_rfc3339())
            .arg(job.attempts_made)
            .invoke_async(&mut conn)
            .await?;

        check_owned(code, job_id)?;
        Ok(transition)
    }

    async fn move_to_delayed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        delay: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let until = Utc::now() + to_chrono(delay);
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .delay
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.list("active"))
            .key(self.keys.list("delayed"))
            .arg(token.to_string())
            .arg(job_id.as_str())
            .arg(ms(until))
            .arg(until.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        check_owned(code, job_id)?;
        Ok(until)
    }

    #[instrument(skip(self))]
    async fn recover_stalled(&self, max_stalled_count: u32) -> StoreResult<StalledReport> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .stalled
            .key(self.keys.list("active"))
            .key(self.keys.list("wait"))
            .key(self.keys.list("failed"))
            .key(self.keys.list("marker"))
            .key(self.keys.job_prefix())
            .arg(max_stalled_count)
            .arg(now.to_rfc3339())
            .arg(ms(now))
            .arg(STALLED_REASON)
            .invoke_async(&mut conn)
            .await?;

        let mut report = StalledReport {
            requeued: requeued.into_iter().map(JobId::from).collect(),
            failed: Vec::with_capacity(failed.len()),
        };
        for id in failed {
            if let Some(job) = self.load(&JobId::from(id)).await? {
                report.failed.push(job);
            }
        }
        Ok(report)
    }

    async fn update_progress(&self, job_id: &JobId, progress: Value) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .set_field
            .key(self.keys.job(job_id))
            .arg("progress")
            .arg(serde_json::to_string(&progress)?)
            .invoke_async(&mut conn)
            .await?;
        check_owned(if updated == 1 { 1 } else { -1 }, job_id)
    }

    async fn add_log(&self, job_id: &JobId, line: String) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = self
            .scripts
            .add_log
            .key(self.keys.job(job_id))
            .key(self.keys.logs(job_id))
            .arg(line)
            .invoke_async(&mut conn)
            .await?;
        usize::try_from(len).map_err(|_| StoreError::NotFound(job_id.clone()))
    }

    async fn update_data(&self, job_id: &JobId, data: Value) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .set_field
            .key(self.keys.job(job_id))
            .arg("data")
            .arg(serde_json::to_string(&data)?)
            .invoke_async(&mut conn)
            .await?;
        check_owned(if updated == 1 { 1 } else { -1 }, job_id)
    }

    async fn counts(&self) -> StoreResult<JobCounts> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(self.keys.list("wait"))
            .cmd("ZCARD")
            .arg(self.keys.list("delayed"))
            .cmd("LLEN")
            .arg(self.keys.list("active"))
            .cmd("ZCARD")
            .arg(self.keys.list("completed"))
            .cmd("ZCARD")
            .arg(self.keys.list("failed"))
            .query_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn wait_for_work(&self, timeout: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let (waiting, next_due): (usize, Vec<(String, f64)>) = redis::pipe()
            .cmd("LLEN")
            .arg(self.keys.list("wait"))
            .cmd("ZRANGE")
            .arg(self.keys.list("delayed"))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        if waiting > 0 {
            return Ok(());
        }

        let mut wait = timeout;
        if let Some((_, due_ms)) = next_due.first() {
            let due_in = *due_ms as i64 - ms(Utc::now());
            if due_in <= 0 {
                return Ok(());
            }
            wait = wait.min(Duration::from_millis(due_in as u64));
        }

        let mut blocking = self.blocking.lock().await;
        if blocking.is_none() {
            *blocking = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = blocking.as_mut() else {
            return Err(StoreError::Communication("blocking connection unavailable".to_string()));
        };

        // BLPOP treats 0 as "forever"; keep a small floor.
        let seconds = wait.as_secs_f64().max(0.01);
        let _: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.keys.list("marker"))
            .arg(seconds)
            .query_async(conn)
            .await?;
        Ok(())
    }

    async fn ready(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

//! Scriptable sandbox processor.
//!
//! Behaviour is driven by the job payload:
//!
//! | `op`            | effect                                               |
//! |-----------------|------------------------------------------------------|
//! | absent          | return `result` (or `42`)                            |
//! | `sleep`         | sleep `ms`, then return as above                     |
//! | `progress`      | report each value of `steps`, then return            |
//! | `log`           | append each string of `lines` to the job log         |
//! | `fail`          | fail the attempt with `message`                      |
//! | `unrecoverable` | fail without retries                                 |
//! | `delay`         | ask to be run again after `ms`                       |
//! | `crash`         | exit the process with `code` (default 1)             |
//! | `abort`         | abort the process (killed by a signal)               |

use std::time::Duration;

use serde_json::{Value, json};

use taskmill_core::{Job, ProcessorError};
use taskmill_infra::processor::{JobContext, processor_fn};
use taskmill_infra::sandbox::child::serve_stdio;

fn result_of(job: &Job) -> Value {
    job.data.get("result").cloned().unwrap_or_else(|| json!(42))
}

fn millis(job: &Job) -> Duration {
    Duration::from_millis(job.data.get("ms").and_then(Value::as_u64).unwrap_or(0))
}

fn message(job: &Job, fallback: &str) -> String {
    job.data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

async fn process(job: Job, ctx: JobContext) -> Result<Value, ProcessorError> {
    let op = job.data.get("op").and_then(Value::as_str).unwrap_or("");
    tracing::debug!(job_id = %job.id, op, "processing");

    match op {
        "" => {}
        "sleep" => tokio::time::sleep(millis(&job)).await,
        "progress" => {
            let steps = job.data.get("steps").and_then(Value::as_array).cloned().unwrap_or_default();
            for step in steps {
                ctx.progress(step).await;
            }
        }
        "log" => {
            let lines = job.data.get("lines").and_then(Value::as_array).cloned().unwrap_or_default();
            for line in lines.iter().filter_map(Value::as_str) {
                ctx.log(line).await;
            }
        }
        "fail" => return Err(ProcessorError::failed(message(&job, "failed by request"))),
        "unrecoverable" => return Err(ProcessorError::unrecoverable(message(&job, "unrecoverable by request"))),
        "delay" => return Err(ProcessorError::Delayed(millis(&job))),
        "crash" => {
            let code = job.data.get("code").and_then(Value::as_i64).unwrap_or(1);
            std::process::exit(i32::try_from(code).unwrap_or(1));
        }
        "abort" => std::process::abort(),
        other => return Err(ProcessorError::unrecoverable(format!("unknown op: {other}"))),
    }

    Ok(result_of(&job))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    taskmill_observability::init_stderr();

    serve_stdio(processor_fn(process)).await?;
    Ok(())
}

//! Child side of the execution protocol.
//!
//! [`serve_stdio`] is what a processor executable calls from `main`: it reads
//! [`ParentMessage`]s from stdin and answers on stdout. Thread-backed
//! contexts drive [`run_loop`] directly over in-process channels.
//!
//! Stdout belongs to the protocol; processor executables must log to stderr.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::processor::{JobContext, Processor, ProgressSink};
use crate::sandbox::protocol::{ChildMessage, ParentMessage, WireError, decode_line, encode_line};

/// Forwards job reports to the parent as protocol messages.
struct ChannelSink {
    tx: mpsc::UnboundedSender<ChildMessage>,
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn progress(&self, value: Value) {
        let _ = self.tx.send(ChildMessage::Progress { value });
    }

    async fn log(&self, line: String) {
        let _ = self.tx.send(ChildMessage::Log { line });
    }

    async fn update(&self, data: Value) {
        let _ = self.tx.send(ChildMessage::Update { data });
    }
}

/// Serve the protocol until `Stop` or until the parent hangs up.
///
/// `resolve` maps the path received in `Init` to a processor; an `Err` is
/// sent back as `InitFailed`. Jobs run one at a time.
pub async fn run_loop<R>(
    resolve: R,
    mut inbox: mpsc::UnboundedReceiver<ParentMessage>,
    outbox: mpsc::UnboundedSender<ChildMessage>,
) where
    R: Fn(&str) -> Result<Arc<dyn Processor>, String>,
{
    let mut processor: Option<Arc<dyn Processor>> = None;

    while let Some(message) = inbox.recv().await {
        let reply = match message {
            ParentMessage::Init { processor_path } => match resolve(&processor_path) {
                Ok(p) => {
                    processor = Some(p);
                    ChildMessage::InitCompleted
                }
                Err(error) => ChildMessage::InitFailed { error },
            },
            ParentMessage::Start { job } => match &processor {
                Some(p) => {
                    let ctx = JobContext::new(Arc::new(ChannelSink { tx: outbox.clone() }));
                    match p.process(&job, &ctx).await {
                        Ok(value) => ChildMessage::Completed { value },
                        Err(err) => ChildMessage::Failed { error: err.into() },
                    }
                }
                None => ChildMessage::Failed {
                    error: WireError::Failed {
                        message: "processor not initialized".to_string(),
                    },
                },
            },
            ParentMessage::Stop => break,
        };

        if outbox.send(reply).is_err() {
            break;
        }
    }
}

/// Run `processor` as a sandbox child over stdin/stdout.
pub async fn serve_stdio<P>(processor: P) -> std::io::Result<()>
where
    P: Processor + 'static,
{
    let processor: Arc<dyn Processor> = Arc::new(processor);

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ChildMessage>();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<ParentMessage>(&line) {
                Ok(message) => {
                    if inbox_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "ignoring malformed parent message"),
            }
        }
        debug!("parent closed stdin");
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbox_rx.recv().await {
            let line = encode_line(&message).map_err(std::io::Error::other)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    run_loop(move |_path| Ok(processor.clone()), inbox_rx, outbox_tx).await;

    reader.abort();
    match writer.await {
        Ok(res) => res,
        Err(join) => Err(std::io::Error::other(join)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use taskmill_core::{Job, JobOptions, ProcessorError};

    use super::*;
    use crate::processor::processor_fn;

    fn spawn_loop() -> (
        mpsc::UnboundedSender<ParentMessage>,
        mpsc::UnboundedReceiver<ChildMessage>,
    ) {
        let processor: Arc<dyn Processor> = Arc::new(processor_fn(|job: Job, ctx: JobContext| async move {
            ctx.progress(10).await;
            match job.data["op"].as_str() {
                Some("fail") => Err(ProcessorError::failed("asked to fail")),
                _ => Ok(json!(42)),
            }
        }));

        let (parent_tx, parent_rx) = mpsc::unbounded_channel();
        let (child_tx, child_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(
            move |path| {
                if path == "known" {
                    Ok(processor.clone())
                } else {
                    Err(format!("unknown {path}"))
                }
            },
            parent_rx,
            child_tx,
        ));
        (parent_tx, child_rx)
    }

    fn job(data: Value) -> Box<Job> {
        Box::new(Job::new("t", data, JobOptions::default(), Utc::now()).unwrap())
    }

    #[tokio::test]
    async fn init_then_start_runs_the_job() {
        let (tx, mut rx) = spawn_loop();

        tx.send(ParentMessage::Init { processor_path: "known".into() }).unwrap();
        assert_eq!(rx.recv().await, Some(ChildMessage::InitCompleted));

        tx.send(ParentMessage::Start { job: job(json!({"foo": "bar"})) }).unwrap();
        assert_eq!(rx.recv().await, Some(ChildMessage::Progress { value: json!(10) }));
        assert_eq!(rx.recv().await, Some(ChildMessage::Completed { value: json!(42) }));
    }

    #[tokio::test]
    async fn unknown_processor_is_reported_as_init_failure() {
        let (tx, mut rx) = spawn_loop();

        tx.send(ParentMessage::Init { processor_path: "missing".into() }).unwrap();
        match rx.recv().await {
            Some(ChildMessage::InitFailed { error }) => assert!(error.contains("missing")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn job_errors_become_failed_messages() {
        let (tx, mut rx) = spawn_loop();
        tx.send(ParentMessage::Init { processor_path: "known".into() }).unwrap();
        rx.recv().await;

        tx.send(ParentMessage::Start { job: job(json!({"op": "fail"})) }).unwrap();
        rx.recv().await; // progress
        assert_eq!(
            rx.recv().await,
            Some(ChildMessage::Failed {
                error: WireError::Failed { message: "asked to fail".into() }
            })
        );
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let (tx, mut rx) = spawn_loop();
        tx.send(ParentMessage::Stop).unwrap();
        assert_eq!(rx.recv().await, None);
    }
}

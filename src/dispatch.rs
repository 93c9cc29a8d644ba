//! Worker pool dispatcher: NDJSON in, cascade per record, NDJSON out.
//!
//! A feeder task streams input records into a channel, a fixed pool of
//! workers pulls from it, and a single writer task owns the output file.
//! Each worker holds at most one outstanding cascade call. With one worker
//! the output order matches the input order; with more it is unspecified,
//! each worker writes on completion.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::cascade::CascadeStrategy;
use crate::error::{Error, Result};

/// Prompt construction and output shaping, supplied by the pipeline stage.
///
/// The cascade never inspects prompts or parses model output beyond this
/// seam; each analysis stage (reporting detection, anachronism
/// classification, obligation extraction, complexity scoring) brings its own
/// codec.
pub trait TaskCodec: Send + Sync {
    /// Build the prompt for one input record.
    fn build_prompt(&self, record: &Value) -> Result<String>;

    /// Shape the backend's raw output into the stage's result record.
    fn parse_output(&self, record: &Value, raw: &str) -> Result<Value>;
}

/// Default codec: prompt from the record's `prompt` (or `text`) field, raw
/// model output passed through under `analysis`.
pub struct SectionCodec;

impl TaskCodec for SectionCodec {
    fn build_prompt(&self, record: &Value) -> Result<String> {
        record
            .get("prompt")
            .or_else(|| record.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::record("record has no prompt or text field"))
    }

    fn parse_output(&self, record: &Value, raw: &str) -> Result<Value> {
        Ok(json!({
            "id": record.get("id").cloned().unwrap_or(Value::Null),
            "analysis": raw,
        }))
    }
}

/// Dispatch knobs for one run.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Worker pool size.
    pub workers: usize,
    /// Stop pulling input after this many records.
    pub limit: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            limit: None,
        }
    }
}

/// Outcome counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Process one record end to end: parse, prompt, cascade, shape output.
async fn process_record(
    strategy: &dyn CascadeStrategy,
    codec: &dyn TaskCodec,
    index: usize,
    line: &str,
) -> Result<String> {
    let record: Value =
        serde_json::from_str(line).map_err(|e| Error::record(format!("invalid JSON: {}", e)))?;

    let record_id = match record.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => index.to_string(),
    };

    let prompt = codec.build_prompt(&record)?;
    let response = strategy.invoke(&record_id, &prompt).await?;

    let mut output = codec.parse_output(&record, &response.content)?;
    if let Some(object) = output.as_object_mut() {
        object.insert(
            "model_used".to_string(),
            Value::String(response.model.clone()),
        );
    }

    Ok(serde_json::to_string(&output)?)
}

/// Run the full pipeline stage over an NDJSON stream.
///
/// Fatal only on unusable input/output paths; per-record failures (malformed
/// lines, cascade exhaustion) are logged and counted, and already-written
/// output lines stay valid.
pub async fn run(
    strategy: Arc<dyn CascadeStrategy>,
    codec: Arc<dyn TaskCodec>,
    input: &Path,
    output: &Path,
    options: DispatchOptions,
) -> Result<RunSummary> {
    let workers = options.workers.max(1);

    let infile = File::open(input)
        .await
        .map_err(|e| Error::config(format!("cannot open input {}: {}", input.display(), e)))?;
    let outfile = File::create(output)
        .await
        .map_err(|e| Error::config(format!("cannot create output {}: {}", output.display(), e)))?;

    let (record_tx, record_rx) = mpsc::channel::<(usize, String)>(workers * 2);
    let record_rx = Arc::new(Mutex::new(record_rx));
    let (line_tx, mut line_rx) = mpsc::channel::<String>(workers * 2);

    let limit = options.limit;
    let feeder = tokio::spawn(async move {
        let mut lines = BufReader::new(infile).lines();
        let mut fed = 0usize;
        loop {
            if limit.is_some_and(|cap| fed >= cap) {
                debug!(fed, "record limit reached, stopping dispatch");
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if record_tx.send((fed, line)).await.is_err() {
                        break;
                    }
                    fed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "input stream read failed, stopping dispatch");
                    break;
                }
            }
        }
        // Dropping the sender drains the pool.
    });

    let writer = tokio::spawn(async move {
        let mut out = BufWriter::new(outfile);
        while let Some(line) = line_rx.recv().await {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await?;
        Ok::<(), std::io::Error>(())
    });

    let processed = Arc::new(AtomicU64::new(0));
    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let strategy = Arc::clone(&strategy);
            let codec = Arc::clone(&codec);
            let record_rx = Arc::clone(&record_rx);
            let line_tx = line_tx.clone();
            let processed = Arc::clone(&processed);
            let succeeded = Arc::clone(&succeeded);
            let failed = Arc::clone(&failed);

            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only for the pull, not the call.
                    let next = { record_rx.lock().await.recv().await };
                    let Some((index, line)) = next else { break };

                    processed.fetch_add(1, Ordering::Relaxed);
                    match process_record(strategy.as_ref(), codec.as_ref(), index, &line).await {
                        Ok(result) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                            if line_tx.send(result).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(record = index, %error, "record failed, continuing");
                        }
                    }
                }
            })
        })
        .collect();
    drop(line_tx);

    for result in join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "worker task aborted");
        }
    }
    let _ = feeder.await;
    writer
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    let summary = RunSummary {
        processed: processed.load(Ordering::Relaxed),
        succeeded: succeeded.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    };
    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "dispatch complete"
    );
    Ok(summary)
}

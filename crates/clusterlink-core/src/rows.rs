//! Incremental decoding of row-oriented JSON responses.
//!
//! Query-style services answer with one JSON object whose row field
//! (`results`, `hits` or `rows`) is an array that can be arbitrarily
//! large. [`RowStreamDecoder`] scans the body byte by byte as chunks
//! arrive, emitting each array element as soon as it is complete and
//! collecting everything else as metadata. [`RowReader`] exposes the rows
//! to the caller through a bounded channel fed by a producer task.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::IgnoredAny;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prelude,
    Rows,
    Epilogue,
    Done,
}

/// Byte-level state machine splitting a response into rows and metadata.
#[derive(Debug)]
pub struct RowStreamDecoder {
    field: &'static str,
    phase: Phase,
    // Envelope scanning.
    depth: usize,
    in_string: bool,
    escaped: bool,
    string: Vec<u8>,
    last_key: Option<Vec<u8>>,
    awaiting_rows: bool,
    meta: Vec<u8>,
    // Row scanning.
    row: Vec<u8>,
    row_depth: usize,
    row_in_string: bool,
    row_escaped: bool,
    // A row was just completed; only `,` or `]` may follow.
    need_separator: bool,
    after_comma: bool,
    rows_seen: usize,
}

impl RowStreamDecoder {
    /// Creates a decoder streaming the array under `field`.
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            phase: Phase::Prelude,
            depth: 0,
            in_string: false,
            escaped: false,
            string: Vec::new(),
            last_key: None,
            awaiting_rows: false,
            meta: Vec::new(),
            row: Vec::new(),
            row_depth: 0,
            row_in_string: false,
            row_escaped: false,
            need_separator: false,
            after_comma: false,
            rows_seen: 0,
        }
    }

    /// Number of rows emitted so far.
    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    /// Consumes one chunk, appending completed rows to `out`.
    ///
    /// Rows completed before a malformed byte are still appended.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<()> {
        for &b in chunk {
            match self.phase {
                Phase::Rows => self.scan_row(b, out)?,
                Phase::Prelude | Phase::Epilogue => self.scan_envelope(b)?,
                Phase::Done => {
                    if !b.is_ascii_whitespace() {
                        return Err(CoreError::protocol("trailing data after response body"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates the end of the body and parses the metadata.
    pub fn finish(self) -> Result<QueryMetadata> {
        if self.phase != Phase::Done {
            return Err(CoreError::protocol(format!(
                "truncated response body after {} row(s)",
                self.rows_seen
            )));
        }
        let raw: Value = serde_json::from_slice(&self.meta)
            .map_err(|e| CoreError::protocol(format!("invalid response metadata: {}", e)))?;
        QueryMetadata::from_value(raw)
    }

    fn scan_envelope(&mut self, b: u8) -> Result<()> {
        if self.in_string {
            self.meta.push(b);
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
                if self.depth == 1 {
                    self.last_key = Some(std::mem::take(&mut self.string));
                }
                return Ok(());
            }
            if self.depth == 1 {
                self.string.push(b);
            }
            return Ok(());
        }

        if b.is_ascii_whitespace() {
            self.meta.push(b);
            return Ok(());
        }
        if self.depth == 0 && b != b'{' {
            return Err(CoreError::protocol(format!(
                "expected a JSON object, found {:?}",
                b as char
            )));
        }

        let opens_rows = self.awaiting_rows && b == b'[' && self.phase == Phase::Prelude;
        self.awaiting_rows = false;
        self.meta.push(b);
        match b {
            b'"' => {
                self.in_string = true;
                self.string.clear();
            }
            b'[' if opens_rows => {
                // The array itself stays in the metadata as `[]`.
                self.phase = Phase::Rows;
            }
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth = self
                    .depth
                    .checked_sub(1)
                    .ok_or_else(|| CoreError::protocol("unbalanced response body"))?;
                if self.depth == 0 {
                    self.phase = Phase::Done;
                }
            }
            b':' if self.depth == 1 => {
                self.awaiting_rows = self.last_key.as_deref() == Some(self.field.as_bytes());
            }
            b',' if self.depth == 1 => self.last_key = None,
            _ => {}
        }
        Ok(())
    }

    fn scan_row(&mut self, b: u8, out: &mut Vec<Bytes>) -> Result<()> {
        if self.row_depth > 0 {
            self.row.push(b);
            if self.row_in_string {
                if self.row_escaped {
                    self.row_escaped = false;
                } else if b == b'\\' {
                    self.row_escaped = true;
                } else if b == b'"' {
                    self.row_in_string = false;
                }
                return Ok(());
            }
            match b {
                b'"' => self.row_in_string = true,
                b'{' | b'[' => self.row_depth += 1,
                b'}' | b']' => {
                    self.row_depth -= 1;
                    if self.row_depth == 0 {
                        self.emit_row(out)?;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        if !self.row.is_empty() {
            // A scalar row in progress.
            if self.row_in_string {
                self.row.push(b);
                if self.row_escaped {
                    self.row_escaped = false;
                } else if b == b'\\' {
                    self.row_escaped = true;
                } else if b == b'"' {
                    self.row_in_string = false;
                    self.emit_row(out)?;
                }
                return Ok(());
            }
            if b == b',' || b == b']' || b.is_ascii_whitespace() {
                self.emit_row(out)?;
            } else {
                self.row.push(b);
                return Ok(());
            }
        }

        match b {
            _ if b.is_ascii_whitespace() => return Ok(()),
            b',' => {
                if !self.need_separator {
                    return Err(CoreError::protocol(format!(
                        "unexpected ',' after row {}",
                        self.rows_seen
                    )));
                }
                self.need_separator = false;
                self.after_comma = true;
                return Ok(());
            }
            b']' => {
                if self.after_comma {
                    return Err(CoreError::protocol("trailing ',' in row array"));
                }
                self.meta.push(b']');
                self.phase = Phase::Epilogue;
                return Ok(());
            }
            _ if self.need_separator => {
                return Err(CoreError::protocol(format!(
                    "missing ',' after row {}",
                    self.rows_seen
                )));
            }
            _ => {}
        }
        self.after_comma = false;
        match b {
            b'{' | b'[' => {
                self.row.push(b);
                self.row_depth = 1;
            }
            b'"' => {
                self.row.push(b);
                self.row_in_string = true;
            }
            _ => self.row.push(b),
        }
        Ok(())
    }

    fn emit_row(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        let row = std::mem::take(&mut self.row);
        serde_json::from_slice::<IgnoredAny>(&row).map_err(|e| {
            CoreError::protocol(format!("malformed row {}: {}", self.rows_seen + 1, e))
        })?;
        self.rows_seen += 1;
        self.need_separator = true;
        trace!(row = self.rows_seen, len = row.len(), "decoded row");
        out.push(Bytes::from(row));
        Ok(())
    }
}

/// Everything in a response body except the rows.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetadata {
    /// Server-assigned request id.
    pub request_id: Option<String>,
    /// Caller-supplied context id, echoed back.
    pub client_context_id: Option<String>,
    /// Final request status.
    pub status: Option<String>,
    /// Execution metrics.
    pub metrics: Option<Value>,
    /// Warnings reported alongside a successful result.
    pub warnings: Vec<Value>,
    /// The metadata object as received, with the row array emptied.
    pub raw: Value,
}

impl QueryMetadata {
    fn from_value(raw: Value) -> Result<Self> {
        if let Some(first) = raw
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            return Err(CoreError::ServiceError {
                status: 200,
                code: first.get("code").and_then(Value::as_u64).map(|c| c as u32),
                message: first
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            request_id: text("requestID"),
            client_context_id: text("clientContextID"),
            status: text("status"),
            metrics: raw.get("metrics").cloned(),
            warnings: raw
                .get("warnings")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            raw,
        })
    }
}

#[derive(Debug, Default)]
struct StreamShared {
    error: OnceLock<CoreError>,
    meta: OnceLock<QueryMetadata>,
}

/// Lazy, forward-only sequence of rows.
///
/// `next()` yields rows in wire order and then `None` forever. Once it has
/// returned `None`, `err()` reports whether the stream ended cleanly.
/// Dropping the reader aborts the producer and releases its connection.
pub struct RowReader {
    rows: mpsc::Receiver<Bytes>,
    shared: Arc<StreamShared>,
    finished: bool,
    producer: AbortHandle,
}

impl RowReader {
    /// Starts a producer decoding `body` into a new reader.
    pub(crate) fn spawn<S, E>(body: S, params: StreamParams, tasks: &TaskTracker) -> RowReader
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(params.buffer.max(1));
        let shared = Arc::new(StreamShared::default());
        let producer_shared = shared.clone();
        let handle = tasks.spawn(async move {
            let deadline = params.deadline.instant();
            let result = tokio::select! {
                _ = params.shutdown.cancelled() => Err(CoreError::Shutdown),
                outcome = tokio::time::timeout_at(deadline, pump(body, &params, &tx)) => {
                    outcome.unwrap_or(Err(CoreError::Timeout { attempts: params.attempts }))
                }
            };
            match result {
                Ok(meta) => {
                    let _ = producer_shared.meta.set(meta);
                }
                Err(err) => {
                    debug!(addr = %params.addr, error = %err, "row stream ended with error");
                    let _ = producer_shared.error.set(err);
                }
            }
            // Dropping the sender after recording the outcome makes the
            // outcome visible before the consumer observes end-of-stream.
            drop(tx);
        });
        RowReader {
            rows: rx,
            shared,
            finished: false,
            producer: handle.abort_handle(),
        }
    }

    /// Next row, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        let row = self.rows.recv().await;
        if row.is_none() {
            self.finished = true;
        }
        row
    }

    /// Terminal error; only meaningful after `next()` returned `None`.
    pub fn err(&self) -> Option<&CoreError> {
        if !self.finished {
            return None;
        }
        self.shared.error.get()
    }

    /// Response metadata; available after a clean end of stream.
    pub fn metadata(&self) -> Option<&QueryMetadata> {
        if !self.finished {
            return None;
        }
        self.shared.meta.get()
    }

    /// Drains the reader, failing with the terminal error if any.
    pub async fn collect_rows(mut self) -> Result<Vec<Bytes>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row);
        }
        match self.err() {
            Some(err) => Err(err.clone()),
            None => Ok(rows),
        }
    }
}

impl Stream for RowReader {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = self.rows.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl Drop for RowReader {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl fmt::Debug for RowReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowReader")
            .field("finished", &self.finished)
            .finish()
    }
}

/// Producer settings for [`RowReader::spawn`].
pub(crate) struct StreamParams {
    pub field: &'static str,
    pub deadline: Deadline,
    pub buffer: usize,
    pub attempts: u32,
    pub addr: String,
    pub shutdown: CancellationToken,
}

async fn pump<S, E>(body: S, params: &StreamParams, tx: &mpsc::Sender<Bytes>) -> Result<QueryMetadata>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut body = Box::pin(body);
    let mut decoder = RowStreamDecoder::new(params.field);
    let mut rows = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| CoreError::transport(&params.addr, e))?;
        let fed = decoder.feed(&chunk, &mut rows);
        for row in rows.drain(..) {
            if tx.send(row).await.is_err() {
                // Reader dropped.
                return Err(CoreError::RequestCanceled);
            }
        }
        fed?;
    }
    decoder.finish()
}

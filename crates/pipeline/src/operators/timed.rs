//! Stages driven by tokio time. Dropping the stream discards whatever they
//! hold, so a stopped pipeline never flushes a half-filled window.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, StreamExt};
use tokio::time::{sleep_until, Instant};

use pulse_core::{meta, ConfigError, Packet, PipelineError, Payload};
use pulse_hub::time_windows;

use super::{Operator, OperatorSpec, StageItem, StageStream};

const DEFAULT_BUFFER_WINDOW: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_BATCH: usize = 100;
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
const DEFAULT_THROTTLE: Duration = Duration::from_millis(1000);

// ── buffer ──────────────────────────────────────────────────────────

/// Collects packets into fixed windows and emits one batch packet per
/// non-empty window. A window reaching `max_batch` packets is emitted early.
///
/// Error items collected in a window are emitted ahead of its batch.
#[derive(Debug)]
pub struct BufferOp {
    window: Duration,
    max_batch: usize,
}

impl BufferOp {
    pub fn new(window: Duration, max_batch: usize) -> Self {
        Self {
            window,
            max_batch: max_batch.max(1),
        }
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        let window = spec.window(DEFAULT_BUFFER_WINDOW)?;
        let max_batch = match spec.params.and_then(|p| p.get("max_batch")) {
            Some(raw) => raw
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| spec.malformed("max_batch must be a positive integer"))?
                as usize,
            None => spec.config.buffer_size_hint.unwrap_or(DEFAULT_MAX_BATCH),
        };
        Ok(Arc::new(BufferOp::new(window, max_batch)))
    }
}

/// Wrap a window's packets into one packet. Type and source come from the
/// first packet, the timestamp from the last.
fn batch_packet(packets: Vec<Packet>) -> Option<Packet> {
    let first = packets.first()?;
    let last = packets.last()?;
    let mut batch = Packet::new(first.stream_type, Payload::Batch(Vec::new()), last.timestamp)
        .with_source(first.source.clone())
        .with_meta(meta::BATCH_SIZE, packets.len().to_string());
    if let Some(metric) = first.metric() {
        if packets.iter().all(|p| p.metric() == Some(metric)) {
            batch = batch.with_meta(meta::METRIC, metric);
        }
    }
    batch.payload = Payload::Batch(packets);
    Some(batch)
}

fn flush_window(items: Vec<StageItem>) -> Vec<StageItem> {
    let (packets, errors): (Vec<StageItem>, Vec<StageItem>) =
        items.into_iter().partition(|item| item.is_ok());
    let packets: Vec<Packet> = packets.into_iter().filter_map(Result::ok).collect();
    errors
        .into_iter()
        .chain(batch_packet(packets).map(Ok))
        .collect()
}

impl Operator for BufferOp {
    fn name(&self) -> &str {
        "buffer"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        time_windows(input, self.window, self.max_batch)
            .flat_map(|items| stream::iter(flush_window(items)))
            .boxed()
    }
}

// ── debounce ────────────────────────────────────────────────────────

/// Emits the latest packet once the input has been quiet for `wait`.
///
/// A packet still waiting when the input ends is emitted right away. Error
/// items are not delayed.
#[derive(Debug)]
pub struct DebounceOp {
    wait: Duration,
}

impl DebounceOp {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        Ok(Arc::new(DebounceOp::new(spec.window(DEFAULT_DEBOUNCE)?)))
    }
}

struct Debounce {
    input: StageStream,
    pending: Option<Packet>,
    deadline: Option<Instant>,
    wait: Duration,
    done: bool,
}

impl Operator for DebounceOp {
    fn name(&self) -> &str {
        "debounce"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let state = Debounce {
            input,
            pending: None,
            deadline: None,
            wait: self.wait,
            done: false,
        };
        stream::unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                let armed = st.deadline.is_some();
                let deadline = st.deadline.unwrap_or_else(Instant::now);

                tokio::select! {
                    biased;
                    _ = sleep_until(deadline), if armed => {
                        st.deadline = None;
                        if let Some(packet) = st.pending.take() {
                            return Some((Ok(packet), st));
                        }
                    }
                    item = st.input.next() => match item {
                        Some(Ok(packet)) => {
                            st.pending = Some(packet);
                            st.deadline = Some(Instant::now() + st.wait);
                        }
                        Some(Err(err)) => return Some((Err::<Packet, PipelineError>(err), st)),
                        None => {
                            st.done = true;
                            if let Some(packet) = st.pending.take() {
                                return Some((Ok(packet), st));
                            }
                        }
                    },
                }
            }
        })
        .boxed()
    }
}

// ── throttle ────────────────────────────────────────────────────────

/// Emits the first packet of each window and drops the rest. A window opens
/// with the first packet after the previous one closed.
#[derive(Debug)]
pub struct ThrottleOp {
    window: Duration,
}

impl ThrottleOp {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        Ok(Arc::new(ThrottleOp::new(spec.window(DEFAULT_THROTTLE)?)))
    }
}

impl Operator for ThrottleOp {
    fn name(&self) -> &str {
        "throttle"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let window = self.window;
        let mut open_until: Option<Instant> = None;
        input
            .filter(move |item| {
                let keep = match item {
                    Err(_) => true,
                    Ok(_) => {
                        let now = Instant::now();
                        match open_until {
                            Some(until) if now < until => false,
                            _ => {
                                open_until = Some(now + window);
                                true
                            }
                        }
                    }
                };
                future::ready(keep)
            })
            .boxed()
    }
}

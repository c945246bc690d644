//! Fixed-duration time windows over a stream.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{sleep_until, Instant};

struct Windows<T> {
    input: BoxStream<'static, T>,
    pending: Vec<T>,
    deadline: Option<Instant>,
    window: Duration,
    max_batch: usize,
    done: bool,
}

impl<T> Windows<T> {
    fn take_batch(&mut self) -> Vec<T> {
        std::mem::take(&mut self.pending)
    }
}

/// Group `input` into consecutive windows of `window` length.
///
/// The first window opens when the returned stream is first polled. A window
/// with no items emits nothing. A window that reaches `max_batch` items is
/// flushed early; the window boundaries stay where they were. When `input`
/// ends the partial window is flushed and the stream ends. Dropping the
/// returned stream discards whatever is pending.
pub fn time_windows<T>(
    input: BoxStream<'static, T>,
    window: Duration,
    max_batch: usize,
) -> BoxStream<'static, Vec<T>>
where
    T: Send + 'static,
{
    let state = Windows {
        input,
        pending: Vec::new(),
        deadline: None,
        window: window.max(Duration::from_millis(1)),
        max_batch: max_batch.max(1),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            let window = st.window;
            let deadline = *st.deadline.get_or_insert_with(|| Instant::now() + window);

            tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    let mut next = deadline + window;
                    let now = Instant::now();
                    if next <= now {
                        next = now + window;
                    }
                    st.deadline = Some(next);
                    if !st.pending.is_empty() {
                        let batch = st.take_batch();
                        return Some((batch, st));
                    }
                }
                item = st.input.next() => match item {
                    Some(item) => {
                        st.pending.push(item);
                        if st.pending.len() >= st.max_batch {
                            let batch = st.take_batch();
                            return Some((batch, st));
                        }
                    }
                    None => {
                        st.done = true;
                        if !st.pending.is_empty() {
                            let batch = st.take_batch();
                            return Some((batch, st));
                        }
                    }
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel_stream(rx: mpsc::UnboundedReceiver<u32>) -> BoxStream<'static, u32> {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn groups_by_window_and_skips_empty_windows() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut windows = time_windows(channel_stream(rx), Duration::from_millis(100), usize::MAX);

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // Idle through the 100..200ms and 200..300ms windows.
            tokio::time::sleep(Duration::from_millis(260)).await;
            tx.send(5).unwrap();
            tx.send(6).unwrap();
        });

        assert_eq!(windows.next().await, Some(vec![0, 1, 2, 3, 4]));
        assert_eq!(windows.next().await, Some(vec![5, 6]));
        producer.await.unwrap();
        assert_eq!(windows.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn size_cap_flushes_early() {
        let input = stream::iter(0..7u32).boxed();
        let batches: Vec<Vec<u32>> =
            time_windows(input, Duration::from_secs(1), 3).collect().await;
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_emits_nothing() {
        let input = stream::empty::<u32>().boxed();
        let batches: Vec<Vec<u32>> =
            time_windows(input, Duration::from_millis(50), 10).collect().await;
        assert!(batches.is_empty());
    }
}

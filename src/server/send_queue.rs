// =============================================================================
// SessionSendQueue — per-session bounded outbound queue with stall-driven
// backpressure disconnect.
// =============================================================================
//
// Grounded almost exclusively in `SessionSendQueue.hpp`/`.cpp`: the
// message/byte thresholds, the arm/disarm stall-timer behavior, and the
// throttled queue-depth log line. The cooperative timer is reimplemented as a
// dedicated tokio task waiting on a `Notify` instead of a condition variable,
// per the "callback-driven I/O becomes tasks + channels" redesign note.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct SendQueueConfig {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub stall_timeout: Duration,
}

struct State {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    closed: bool,
    stall_deadline: Option<Instant>,
    last_logged: Option<(usize, usize, Instant)>,
}

/// Invoked exactly once, outside any lock, when the stall timer expires.
pub type BackpressureCallback = Arc<dyn Fn() + Send + Sync>;

pub struct SessionSendQueue {
    client_id: String,
    config: SendQueueConfig,
    state: Mutex<State>,
    notify: Notify,
    on_backpressure: BackpressureCallback,
    stall_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSendQueue {
    pub fn new(client_id: String, config: SendQueueConfig, on_backpressure: BackpressureCallback) -> Arc<Self> {
        let queue = Arc::new(Self {
            client_id,
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                queued_bytes: 0,
                closed: false,
                stall_deadline: None,
                last_logged: None,
            }),
            notify: Notify::new(),
            on_backpressure,
            stall_task: Mutex::new(None),
        });
        let handle = spawn_stall_timer(Arc::clone(&queue));
        *queue.stall_task.lock() = Some(handle);
        queue
    }

    /// Drops the payload if the queue is already closed. Otherwise appends it,
    /// updates `queuedBytes`, reevaluates the stall timer, and wakes any
    /// waiting writer.
    pub fn enqueue(&self, payload: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.queued_bytes += payload.len();
        state.queue.push_back(payload);
        self.update_stall_timer_locked(&mut state);
        self.log_queue_locked(&mut state);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Waits until a payload is available, returning `None` once the queue is
    /// closed and fully drained (the writer should tear down the socket).
    pub async fn recv_next(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(payload) = state.queue.pop_front() {
                    return Some(payload);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Decrements `queuedBytes` for the payload just written and reevaluates
    /// the stall timer.
    pub fn on_write_complete(&self, bytes_written: usize) {
        let mut state = self.state.lock();
        state.queued_bytes = state.queued_bytes.saturating_sub(bytes_written);
        self.update_stall_timer_locked(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current `(queue_len, queued_bytes)` snapshot, used for close logging.
    pub fn depth(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queue.len(), state.queued_bytes)
    }

    /// Marks the queue closed to future enqueues without discarding what is
    /// already queued (used for a graceful session close, where the close
    /// frame itself is the last thing drained).
    pub fn close_gracefully(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.close_gracefully();
        if let Some(handle) = self.stall_task.lock().take() {
            handle.abort();
        }
    }

    fn above_threshold_locked(&self, state: &State) -> bool {
        state.queue.len() > self.config.max_messages || state.queued_bytes > self.config.max_bytes
    }

    fn update_stall_timer_locked(&self, state: &mut State) {
        if self.above_threshold_locked(state) {
            if state.stall_deadline.is_none() {
                state.stall_deadline = Some(Instant::now() + self.config.stall_timeout);
                self.notify.notify_one();
            }
        } else {
            state.stall_deadline = None;
        }
    }

    fn log_queue_locked(&self, state: &mut State) {
        let now = Instant::now();
        let should_log = match state.last_logged {
            None => true,
            Some((_, _, at)) => now.duration_since(at) >= Duration::from_secs(1),
        };
        if !should_log {
            return;
        }
        state.last_logged = Some((state.queue.len(), state.queued_bytes, now));
        debug!(
            client_id = %self.client_id,
            queue_msgs = state.queue.len(),
            queue_bytes = state.queued_bytes,
            "send queue depth"
        );
    }
}

fn spawn_stall_timer(queue: Arc<SessionSendQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = queue.state.lock().stall_deadline;
            match deadline {
                None => queue.notify.notified().await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let fired = {
                            let mut state = queue.state.lock();
                            if state.closed {
                                false
                            } else {
                                state.queue.clear();
                                state.queued_bytes = 0;
                                state.closed = true;
                                state.stall_deadline = None;
                                true
                            }
                        };
                        if fired {
                            warn!(client_id = %queue.client_id, "send queue stalled, closing for backpressure");
                            (queue.on_backpressure)();
                        }
                        queue.notify.notify_one();
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(deadline - now) => {}
                        _ = queue.notify.notified() => {}
                    }
                }
            }
            if queue.state.lock().closed {
                return;
            }
        }
    })
}

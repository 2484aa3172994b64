//! Per-port worker loops.
//!
//! Each port runs one write worker and one eval worker. Both drain their
//! queue one item at a time and return once the queue is closed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::trace;

use super::port::Port;

pub(super) async fn write_loop(port: Arc<Port>) {
    while let Some(req) = port.write_queue.pop().await {
        port.process_write(req).await;
    }
    trace!(port_id = %port.id(), "Write worker finished");
}

pub(super) async fn eval_loop(port: Arc<Port>) {
    while let Some(ctx) = port.eval_queue.pop().await {
        port.eval_pending.store(false, Ordering::SeqCst);
        port.evaluate(&ctx).await;
    }
    trace!(port_id = %port.id(), "Eval worker finished");
}

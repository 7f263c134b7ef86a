//! The dispatch loop.
//!
//! Waits on a single fan-in channel carrying per-task wakes and refresh
//! signals. A task wake spawns one execution unit on the tracker and the
//! loop goes straight back to waiting; it never awaits job execution.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::engine::{Shared, Wake};
use crate::execute;

pub(crate) async fn run(shared: Arc<Shared>, mut wakes: mpsc::UnboundedReceiver<Wake>) {
    info!(
        worker = %shared.name,
        tasks = shared.registry.len(),
        "dispatch loop started"
    );

    loop {
        if shared.is_draining() {
            break;
        }
        let Some(wake) = wakes.recv().await else {
            debug!("wake channel closed");
            break;
        };

        match wake {
            Wake::Refresh => trace!("refresh"),
            Wake::Task(slot) => {
                let Some(task) = shared.registry.slot(slot) else {
                    continue;
                };
                task.disarm_wake();
                if shared.is_draining() {
                    break;
                }
                trace!(task = %task.name, slot, "spawning execution unit");
                shared.tracker.spawn(execute::run(shared.clone(), slot));
            }
        }
    }

    info!(worker = %shared.name, "dispatch loop stopped");
}

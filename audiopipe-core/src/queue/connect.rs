use std::sync::Arc;

use tracing::{info, warn};

use super::error::{QueueError, QueueResult};
use super::{JobDispatcher, LocalJobQueue, QueueSettings, SqliteJobQueue};
use crate::config::PipelineConfig;

/// Picks the dispatcher once at startup. The durable queue is opened and
/// pinged; when that fails the in-process queue is used instead, unless the
/// configuration insists on durability.
pub fn connect_dispatcher(config: &PipelineConfig) -> QueueResult<Arc<dyn JobDispatcher>> {
    let settings = QueueSettings::from_config(config);
    let durable = SqliteJobQueue::builder()
        .path(&config.queue.queue_db)
        .settings(settings.clone())
        .build()
        .and_then(|queue| {
            queue.initialize()?;
            queue.ping()?;
            Ok(queue)
        });

    match durable {
        Ok(queue) => {
            info!(path = %config.queue.queue_db.display(), "using durable job queue");
            Ok(Arc::new(queue))
        }
        Err(err) if config.queue.require_durable => Err(QueueError::ServiceUnavailable(format!(
            "durable job queue at {} is unreachable: {err}",
            config.queue.queue_db.display()
        ))),
        Err(err) => {
            warn!(
                path = %config.queue.queue_db.display(),
                error = %err,
                "durable job queue unavailable, falling back to in-process queue"
            );
            Ok(Arc::new(LocalJobQueue::new(settings)))
        }
    }
}

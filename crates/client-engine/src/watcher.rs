use std::sync::Arc;

use futures::StreamExt as _;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use tracing::{debug, warn};

use pywren_client_core::keys::CallId;

use crate::api::InvokerEvent;
use crate::invoke::JobContext;
use crate::invoker::{InvokerShared, Token};

/// Start the completion watcher for one job. Exactly one runs per job; the
/// broker variant is selected by configuration, everything else polls the
/// object store.
pub(crate) fn spawn_watcher(shared: Arc<InvokerShared>, ctx: Arc<JobContext>) {
    tokio::spawn(async move {
        if shared.rabbitmq_monitor {
            broker_watch(shared, ctx).await;
        } else {
            poll_watch(shared, ctx).await;
        }
    });
}

/// Poll the job status record, producing one token per newly seen
/// completion. Tolerates up to `watcher_retries` consecutive poll failures
/// before failing the whole job.
async fn poll_watch(shared: Arc<InvokerShared>, ctx: Arc<JobContext>) {
    let spec = &ctx.spec;
    let total = spec.total_calls;
    debug!(
        executor_id = %spec.executor_id,
        job_id = %spec.job_id,
        "starting job status watcher"
    );

    let mut done_so_far: u32 = 0;
    let mut consecutive_failures: u32 = 0;
    // Termination follows the board's terminal tally, not the raw completion
    // count: a call whose dispatch budget runs out is failed on the board and
    // never writes a status record.
    while ctx.board.resolved_count() < total {
        match shared
            .storage
            .get_job_status(&spec.executor_id, &spec.job_id)
            .await
        {
            Ok(done) => {
                consecutive_failures = 0;
                let seen = (done.len() as u32).min(total);
                let fresh = seen.saturating_sub(done_so_far);
                for _ in 0..fresh {
                    shared.token_bucket.offer(Token);
                }
                done_so_far += fresh;
                ctx.board.mark_done_set(&done);
                if fresh > 0 {
                    debug!(job_id = %spec.job_id, done = done_so_far, total, "job status update");
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures > shared.watcher_retries {
                    let reason = format!("job status poll failed: {err:#}");
                    warn!(job_id = %spec.job_id, "{reason}");
                    ctx.board.fail_job(reason.clone());
                    shared.emit(InvokerEvent::WatcherFailed {
                        job_id: spec.job_id.clone(),
                        reason,
                    });
                    return;
                }
            }
        }
        if ctx.board.resolved_count() >= total {
            break;
        }
        tokio::time::sleep(shared.poll_tick).await;
    }

    debug!(job_id = %spec.job_id, "job status watcher finished");
    shared.emit(InvokerEvent::JobCompleted {
        job_id: spec.job_id.clone(),
    });
}

/// Fanout exchange carrying the completion signals of one job.
pub(crate) fn completion_exchange(executor_id: &str, job_id: &str) -> String {
    format!("pywren-{executor_id}-{job_id}")
}

async fn broker_watch(shared: Arc<InvokerShared>, ctx: Arc<JobContext>) {
    if let Err(err) = consume_completions(&shared, &ctx).await {
        let reason = format!("completion broker failed: {err:#}");
        warn!(job_id = %ctx.spec.job_id, "{reason}");
        ctx.board.fail_job(reason.clone());
        shared.emit(InvokerEvent::WatcherFailed {
            job_id: ctx.spec.job_id.clone(),
            reason,
        });
    }
}

/// Body of a completion message. The body is not required by the engine
/// (every message counts as one completion), but a recognizable `call_id`
/// lets the call's handle resolve individually.
#[derive(Debug, Deserialize)]
struct CompletionNote {
    #[serde(default)]
    call_id: Option<CallId>,
}

async fn consume_completions(shared: &InvokerShared, ctx: &JobContext) -> anyhow::Result<()> {
    let spec = &ctx.spec;
    let url = shared.amqp_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("rabbitmq_monitor is enabled but rabbitmq.amqp_url is not configured")
    })?;
    let exchange = completion_exchange(&spec.executor_id, &spec.job_id);
    let queue = format!("{exchange}-1");
    debug!(job_id = %spec.job_id, %exchange, "starting broker completion watcher");

    let connection = Connection::connect(url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .exchange_declare(
            &exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &queue,
            &exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let mut consumer = channel
        .basic_consume(
            &queue,
            "completion-watcher",
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    // A call whose dispatch budget runs out never publishes a completion
    // message, so the job can drain with fewer than `total_calls` messages.
    // The board wakes the select below when that happens.
    let mut board_rx = ctx.board.subscribe();
    let mut done_so_far: u32 = 0;
    while ctx.board.resolved_count() < spec.total_calls {
        tokio::select! {
            delivery = consumer.next() => {
                let delivery = match delivery {
                    Some(delivery) => delivery?,
                    None => anyhow::bail!(
                        "completion stream ended after {done_so_far} of {} calls",
                        spec.total_calls
                    ),
                };
                shared.token_bucket.offer(Token);
                done_so_far += 1;
                match serde_json::from_slice::<CompletionNote>(&delivery.data) {
                    Ok(CompletionNote {
                        call_id: Some(call_id),
                    }) => ctx.board.mark_done(call_id),
                    _ => ctx.board.mark_anonymous(),
                }
            }
            changed = board_rx.changed() => {
                if changed.is_err() {
                    anyhow::bail!("completion board closed");
                }
            }
        }
    }

    channel
        .exchange_delete(&exchange, ExchangeDeleteOptions::default())
        .await?;
    debug!(job_id = %spec.job_id, "broker completion watcher finished");
    shared.emit(InvokerEvent::JobCompleted {
        job_id: spec.job_id.clone(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_and_queue_names_are_stable() {
        let exchange = completion_exchange("ex1", "A033");
        assert_eq!(exchange, "pywren-ex1-A033");
        assert_eq!(format!("{exchange}-1"), "pywren-ex1-A033-1");
    }

    #[test]
    fn completion_note_tolerates_arbitrary_bodies() {
        let with_id: CompletionNote =
            serde_json::from_slice(br#"{"call_id": "00004", "exec_time": 1.5}"#).unwrap();
        assert_eq!(with_id.call_id, Some(CallId::new(4)));

        let without_id: CompletionNote = serde_json::from_slice(br#"{"status": "done"}"#).unwrap();
        assert!(without_id.call_id.is_none());

        assert!(serde_json::from_slice::<CompletionNote>(b"not json").is_err());
    }
}

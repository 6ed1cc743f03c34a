//! The queue's request server: one connection per request, each handled on its own task.

use std::io;
use std::sync::Arc;

use bq_utils::error::{AnyError, ErrorWorker, OpaqueResult, ResultLocation, WorkerfulError};
use bq_utils::net_protocol::ids::{JobId, PayloadSignature, WorkerId};
use bq_utils::net_protocol::queue::{
    BucketResult, GetBucket, JobResults, Message, QueueError, QueueVersion, ReportAlive, Request,
    ScheduleTests,
};
use bq_utils::server_shutdown::ShutdownReceiver;
use bq_utils::{here, log_workerful_error, net_protocol};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{instrument, Instrument};

use crate::balancing::SharedBalancingQueue;
use crate::enqueuer::TestsEnqueuer;
use crate::worker_configurations::WorkerConfigurations;

/// An error that happens in the construction or execution of the queue server.
///
/// Does not include errors in the handling of requests to the queue, but does include errors in
/// the acceptance or dispatch of connections.
#[derive(Debug, Error)]
pub enum QueueServerError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(#[from] AnyError),
}

#[derive(Clone)]
struct QueueServerCtx {
    queue: SharedBalancingQueue,
    enqueuer: TestsEnqueuer,
    worker_configurations: Arc<WorkerConfigurations>,
    payload_signature: PayloadSignature,
}

impl QueueServerCtx {
    fn check_signature(&self, payload_signature: &PayloadSignature) -> Result<(), QueueError> {
        if payload_signature != &self.payload_signature {
            return Err(QueueError::SignatureMismatch);
        }
        Ok(())
    }
}

pub struct QueueServer {
    ctx: QueueServerCtx,
}

impl QueueServer {
    pub fn new(
        queue: SharedBalancingQueue,
        worker_configurations: WorkerConfigurations,
        payload_signature: PayloadSignature,
    ) -> Self {
        Self {
            ctx: QueueServerCtx {
                enqueuer: TestsEnqueuer::new(queue.clone()),
                queue,
                worker_configurations: Arc::new(worker_configurations),
                payload_signature,
            },
        }
    }

    pub async fn start(
        self,
        listener: TcpListener,
        mut shutdown: ShutdownReceiver,
    ) -> Result<(), QueueServerError> {
        let Self { ctx } = self;

        loop {
            let client = tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((conn, _)) => conn,
                        Err(e) => {
                            tracing::error!("error accepting connection to queue: {:?}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = Self::handle(ctx, client).await;
                if let Err(error) = result {
                    log_workerful_error!(error, "error handling connection to queue: {}")
                }
            }
            .in_current_span());
        }

        Ok(())
    }

    #[inline(always)]
    async fn handle(ctx: QueueServerCtx, mut stream: TcpStream) -> Result<(), WorkerfulError> {
        let Request { message } = net_protocol::async_read(&mut stream)
            .await
            .located(here!())
            .no_worker()?;

        match message {
            Message::RegisterWorker(worker_id) => {
                Self::handle_register_worker(&ctx, &worker_id, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::GetBucket(get_bucket) => {
                let worker_id = get_bucket.worker_id.clone();
                Self::handle_get_bucket(&ctx, get_bucket, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::ReportAlive(report_alive) => {
                let worker_id = report_alive.worker_id.clone();
                Self::handle_report_alive(&ctx, report_alive, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::BucketResult(bucket_result) => {
                let worker_id = bucket_result.worker_id.clone();
                Self::handle_bucket_result(&ctx, bucket_result, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::ScheduleTests(schedule) => {
                Self::handle_schedule_tests(&ctx, schedule, stream)
                    .await
                    .no_worker()
            }
            Message::JobState(job_id) => Self::handle_job_state(&ctx, job_id, stream)
                .await
                .no_worker(),
            Message::JobResults(job_id) => Self::handle_job_results(&ctx, job_id, stream)
                .await
                .no_worker(),
            Message::JobDelete(job_id) => Self::handle_job_delete(&ctx, job_id, stream)
                .await
                .no_worker(),
            Message::DisableWorker(worker_id) => {
                Self::handle_toggle_worker(&ctx, &worker_id, false, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::EnableWorker(worker_id) => {
                Self::handle_toggle_worker(&ctx, &worker_id, true, stream)
                    .await
                    .worker(&worker_id)
            }
            Message::QueueVersion => Self::handle_queue_version(stream).await.no_worker(),
        }
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_register_worker(
        ctx: &QueueServerCtx,
        worker_id: &WorkerId,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        ctx.queue.aliveness().register(worker_id);
        let response: net_protocol::queue::RegisterWorkerResponse = Ok(ctx
            .worker_configurations
            .for_worker(worker_id, &ctx.payload_signature));

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, get_bucket, stream), fields(worker_id = ?get_bucket.worker_id))]
    async fn handle_get_bucket(
        ctx: &QueueServerCtx,
        get_bucket: GetBucket,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let GetBucket {
            worker_id,
            request_id,
            capabilities,
            payload_signature,
        } = get_bucket;

        let response: net_protocol::queue::GetBucketResponse = ctx
            .check_signature(&payload_signature)
            .map(|()| ctx.queue.dequeue_bucket(&worker_id, &request_id, &capabilities));

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, report_alive, stream), fields(worker_id = ?report_alive.worker_id))]
    async fn handle_report_alive(
        ctx: &QueueServerCtx,
        report_alive: ReportAlive,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let ReportAlive {
            worker_id,
            bucket_ids_being_processed,
            payload_signature,
        } = report_alive;

        let response: net_protocol::queue::ReportAliveResponse =
            ctx.check_signature(&payload_signature).and_then(|()| {
                ctx.queue
                    .aliveness()
                    .report_alive(&worker_id, bucket_ids_being_processed)
            });

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, bucket_result, stream), fields(worker_id = ?bucket_result.worker_id))]
    async fn handle_bucket_result(
        ctx: &QueueServerCtx,
        bucket_result: BucketResult,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let BucketResult {
            worker_id,
            request_id,
            testing_result,
            payload_signature,
        } = bucket_result;

        let response: net_protocol::queue::BucketResultResponse = ctx
            .check_signature(&payload_signature)
            .and_then(|()| ctx.queue.accept(&worker_id, &request_id, testing_result));

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, schedule, stream), fields(job_id = ?schedule.prioritized_job.job_id))]
    async fn handle_schedule_tests(
        ctx: &QueueServerCtx,
        schedule: ScheduleTests,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let response: net_protocol::queue::ScheduleTestsResponse = ctx.enqueuer.enqueue(schedule);
        if let Err(error) = &response {
            tracing::info!(%error, "schedule request refused");
        }

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_job_state(
        ctx: &QueueServerCtx,
        job_id: JobId,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let response: net_protocol::queue::JobStateResponse = ctx.queue.job_state(&job_id);

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_job_results(
        ctx: &QueueServerCtx,
        job_id: JobId,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let response: net_protocol::queue::JobResultsResponse =
            ctx.queue
                .results(&job_id)
                .map(|testing_results| JobResults {
                    job_id,
                    testing_results,
                });

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_job_delete(
        ctx: &QueueServerCtx,
        job_id: JobId,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let response: net_protocol::queue::JobDeleteResponse = ctx.queue.delete_job(&job_id);

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(ctx, stream))]
    async fn handle_toggle_worker(
        ctx: &QueueServerCtx,
        worker_id: &WorkerId,
        enable: bool,
        mut stream: TcpStream,
    ) -> OpaqueResult<()> {
        let aliveness = ctx.queue.aliveness();
        if enable {
            aliveness.unblock(worker_id);
        } else {
            aliveness.block(worker_id);
        }
        let response: net_protocol::queue::WorkerToggleResponse = Ok(worker_id.clone());

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(stream))]
    async fn handle_queue_version(mut stream: TcpStream) -> OpaqueResult<()> {
        let response = QueueVersion {
            version: bq_utils::VERSION.to_owned(),
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }
}

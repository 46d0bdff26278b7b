use std::pin::Pin;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    JobState as ProtoJobState, QueryRequest, QueryResponse, StartRequest, StartResponse,
    StopRequest, StopResponse, StreamRequest, StreamResponse,
};
use crate::worker::logs::LogError;
use crate::worker::process::ProcessError;
use crate::worker::{CmdStatus, JobId, JobRegistry, JobState};

/// Response metadata key carrying the id generated by a failed Start.
pub const JOB_ID_METADATA: &str = "x-job-id";

type OutputStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<StreamResponse, Status>> + Send>>;

/// gRPC front of the job registry.
pub struct WorkerApi {
    registry: JobRegistry,
    /// Parent of every Stream call's cancellation token.
    shutdown: CancellationToken,
}

impl WorkerApi {
    pub fn new(registry: JobRegistry, shutdown: CancellationToken) -> Self {
        Self { registry, shutdown }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerApi {
    type StreamStream = OutputStream;

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();

        let mut command_and_args = Vec::with_capacity(req.args.len() + 1);
        command_and_args.push(req.process_name);
        command_and_args.extend(req.args);

        let job_id = self.registry.start(command_and_args).await?;

        Ok(Response::new(StartResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        self.registry.stop(&job_id).await?;
        Ok(Response::new(StopResponse {}))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let status = self.registry.query(&job_id).await?;
        Ok(Response::new(status_to_proto(&status)))
    }

    async fn stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;

        // Dropping the response stream (client cancelled or disconnected)
        // drops the log stream, which stops its follower.
        let logs = self
            .registry
            .stream(self.shutdown.child_token(), &job_id)
            .await?;
        tracing::debug!(job_id = %job_id, "Streaming job output");

        let output = logs.map(|chunk| Ok(StreamResponse { chunk }));
        Ok(Response::new(Box::pin(output) as Self::StreamStream))
    }
}

/// Ids that do not parse can never have been issued, so they are reported
/// the same way as unknown ids.
fn parse_job_id(raw: &str) -> Result<JobId, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::from(WorkerError::JobNotFound(raw.to_string())))
}

pub fn state_to_proto(state: JobState) -> ProtoJobState {
    match state {
        JobState::None => ProtoJobState::None,
        JobState::Running => ProtoJobState::Running,
        JobState::Success => ProtoJobState::Success,
        JobState::Failed => ProtoJobState::Failed,
        JobState::Stopped => ProtoJobState::Stopped,
    }
}

pub fn state_from_proto(state: ProtoJobState) -> JobState {
    match state {
        ProtoJobState::None => JobState::None,
        ProtoJobState::Running => JobState::Running,
        ProtoJobState::Success => JobState::Success,
        ProtoJobState::Failed => JobState::Failed,
        ProtoJobState::Stopped => JobState::Stopped,
    }
}

/// Decode a `status` field as received on the wire. Values this build does
/// not know decode as [`JobState::None`].
pub fn state_from_wire(status: i32) -> JobState {
    ProtoJobState::try_from(status)
        .map(state_from_proto)
        .unwrap_or_default()
}

fn status_to_proto(status: &CmdStatus) -> QueryResponse {
    QueryResponse {
        process_id: status.process_id,
        exit_code: i64::from(status.exit_code),
        status: state_to_proto(status.state) as i32,
        started_at_ms: status.started_at.timestamp_millis(),
        finished_at_ms: status.finished_at.map(|t| t.timestamp_millis()),
    }
}

impl From<WorkerError> for Status {
    fn from(err: WorkerError) -> Self {
        let message = err.to_string();
        let mut status = match &err {
            WorkerError::InvalidArgument(_) => Status::invalid_argument(message),
            WorkerError::JobNotFound(_) | WorkerError::Log(LogError::NotFound(_)) => {
                Status::not_found(message)
            }
            WorkerError::Terminate {
                source: ProcessError::NotStarted | ProcessError::AlreadyFinished(_),
                ..
            } => Status::failed_precondition(message),
            WorkerError::Unauthorized => Status::permission_denied(message),
            _ => Status::internal(message),
        };

        if let Some(job_id) = err.job_id() {
            if let Ok(value) = job_id.to_string().parse::<MetadataValue<Ascii>>() {
                status.metadata_mut().insert(JOB_ID_METADATA, value);
            }
        }

        status
    }
}

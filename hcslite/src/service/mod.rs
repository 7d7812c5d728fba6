//! Manager-facing task RPC service.
//!
//! Implements the generated `hcslite.v1.Task` service. Every handler runs
//! through the same spine: admit via the shutdown gate, resolve the
//! addressed task (the request id must match the shim's configured task id
//! and the slot must be populated), resolve the addressed exec, dispatch.

pub mod shutdown;

use crate::bootstrap;
use crate::compute::{ComputeBackend, MountSpec};
use crate::config::Config;
use crate::events::EventPublisher;
use crate::exec::ExecSnapshot;
use crate::notify::NotificationDispatcher;
use crate::relay::StdioSet;
use crate::task::Task;
use hcslite_shared::generated::task_server::Task as TaskRpc;
use hcslite_shared::{
    time, CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse,
    CreateTaskRequest, CreateTaskResponse, DeleteRequest, DeleteResponse, ExecProcessRequest,
    HcsliteError, HcsliteResult, KillRequest, PauseRequest, PidsRequest, PidsResponse,
    ResizePtyRequest, ResumeRequest, StartRequest, StartResponse, StateRequest, StateResponse,
    StatsRequest, StatsResponse, TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskIo,
    TaskStart, TaskStatus, UpdateTaskRequest, WaitRequest, WaitResponse,
};
use parking_lot::Mutex;
use shutdown::{RequestGuard, ShutdownCoordinator};
use std::path::Path;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

enum TaskSlot {
    Vacant,
    Occupied(Arc<Task>),
    Deleted,
}

/// The singleton service one shim process hosts.
pub struct TaskService {
    task_id: String,
    namespace: String,
    backend: Arc<dyn ComputeBackend>,
    dispatcher: Arc<NotificationDispatcher>,
    publisher: Arc<EventPublisher>,
    shutdown: Arc<ShutdownCoordinator>,
    config: Config,
    slot: Arc<Mutex<TaskSlot>>,
}

impl TaskService {
    /// Build the service and start routing backend notifications.
    pub fn new(
        task_id: impl Into<String>,
        namespace: impl Into<String>,
        backend: Arc<dyn ComputeBackend>,
        publisher: Arc<EventPublisher>,
        config: Config,
    ) -> HcsliteResult<Arc<Self>> {
        let dispatcher = NotificationDispatcher::new();
        let notifications = backend.take_notifications()?;
        dispatcher.run(notifications);

        Ok(Arc::new(Self {
            task_id: task_id.into(),
            namespace: namespace.into(),
            backend,
            dispatcher,
            publisher,
            shutdown: ShutdownCoordinator::new(),
            config,
            slot: Arc::new(Mutex::new(TaskSlot::Vacant)),
        }))
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Exit signal for the serve loop.
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    fn guard(&self) -> Result<RequestGuard, Status> {
        self.shutdown
            .guard()
            .ok_or_else(|| Status::unavailable("shim is shutting down"))
    }

    fn resolve_task(&self, id: &str) -> HcsliteResult<Arc<Task>> {
        if id != self.task_id {
            return Err(HcsliteError::NotFound(format!("task {id}")));
        }
        match &*self.slot.lock() {
            TaskSlot::Occupied(task) => Ok(Arc::clone(task)),
            _ => Err(HcsliteError::NotFound(format!("task {id}"))),
        }
    }

    fn state_response(&self, task: &Task, snapshot: ExecSnapshot) -> StateResponse {
        StateResponse {
            id: self.task_id.clone(),
            exec_id: snapshot.id,
            bundle: task.bundle().display().to_string(),
            pid: snapshot.pid,
            status: TaskStatus::from(snapshot.status).into(),
            stdin: snapshot.stdio.stdin,
            stdout: snapshot.stdio.stdout,
            stderr: snapshot.stdio.stderr,
            terminal: snapshot.terminal,
            exit_status: snapshot.exit.map(|e| e.exit_code).unwrap_or(0),
            exited_at: snapshot.exit.map(|e| time::to_proto(e.exited_at)),
        }
    }
}

fn decode_process_spec(any: Option<&prost_types::Any>) -> HcsliteResult<oci_spec::runtime::Process> {
    let any = any.ok_or_else(|| HcsliteError::InvalidArgument("exec spec is required".into()))?;
    serde_json::from_slice(&any.value)
        .map_err(|err| HcsliteError::InvalidArgument(format!("decoding process spec: {err}")))
}

fn mount_specs(mounts: Vec<hcslite_shared::Mount>) -> Vec<MountSpec> {
    mounts
        .into_iter()
        .map(|m| MountSpec {
            read_only: m.options.iter().any(|o| o == "ro"),
            host_path: m.source,
            container_path: m.target,
        })
        .collect()
}

#[tonic::async_trait]
impl TaskRpc for TaskService {
    async fn state(
        &self,
        request: Request<StateRequest>,
    ) -> Result<Response<StateResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        debug!(task_id = %req.id, exec_id = %req.exec_id, "state request");

        let task = self.resolve_task(&req.id)?;
        let snapshot = task.snapshot(&req.exec_id).await?;
        Ok(Response::new(self.state_response(&task, snapshot)))
    }

    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        info!(task_id = %req.id, bundle = %req.bundle, "create request");

        if req.id != self.task_id {
            return Err(HcsliteError::NotFound(format!("task {}", req.id)).into());
        }
        if !matches!(&*self.slot.lock(), TaskSlot::Vacant) {
            return Err(HcsliteError::AlreadyExists(format!("task {}", req.id)).into());
        }

        let stdio = StdioSet::new(req.stdin, req.stdout, req.stderr, req.terminal)?;
        let io_event = TaskIo {
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            terminal: stdio.terminal,
        };

        let task = Task::create(
            &req.id,
            Path::new(&req.bundle),
            stdio,
            mount_specs(req.rootfs),
            &self.backend,
            &self.dispatcher,
            &self.publisher,
            &self.config,
        )
        .await?;

        {
            let mut slot = self.slot.lock();
            if !matches!(&*slot, TaskSlot::Vacant) {
                return Err(HcsliteError::AlreadyExists(format!("task {}", req.id)).into());
            }
            *slot = TaskSlot::Occupied(Arc::clone(&task));
        }

        self.publisher
            .publish(&TaskCreate {
                task_id: req.id.clone(),
                bundle: req.bundle,
                io: Some(io_event),
                pid: 0,
            })
            .await;

        Ok(Response::new(CreateTaskResponse { pid: 0 }))
    }

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        info!(task_id = %req.id, exec_id = %req.exec_id, "start request");

        let task = self.resolve_task(&req.id)?;
        let pid = task.start(&req.exec_id).await?;

        if req.exec_id.is_empty() {
            self.publisher
                .publish(&TaskStart {
                    task_id: req.id,
                    pid,
                })
                .await;
        } else {
            self.publisher
                .publish(&TaskExecStarted {
                    task_id: req.id,
                    exec_id: req.exec_id,
                    pid,
                })
                .await;
        }

        Ok(Response::new(StartResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        info!(task_id = %req.id, exec_id = %req.exec_id, "delete request");

        let task = self.resolve_task(&req.id)?;
        let status = task.delete_exec(&req.exec_id).await?;

        if req.exec_id.is_empty() {
            *self.slot.lock() = TaskSlot::Deleted;

            if let Err(err) = bootstrap::write_deleted_marker(task.bundle(), &status) {
                warn!(task_id = %req.id, error = %err, "writing deleted marker failed");
            }

            self.publisher
                .publish(&TaskDelete {
                    task_id: req.id,
                    pid: status.pid,
                    exit_status: status.exit_code,
                    exited_at: Some(time::to_proto(status.exited_at)),
                })
                .await;
        }

        Ok(Response::new(DeleteResponse {
            pid: status.pid,
            exit_status: status.exit_code,
            exited_at: Some(time::to_proto(status.exited_at)),
        }))
    }

    async fn pids(&self, request: Request<PidsRequest>) -> Result<Response<PidsResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        Ok(Response::new(PidsResponse {
            processes: task.pids().await,
        }))
    }

    async fn pause(&self, request: Request<PauseRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        self.resolve_task(&req.id)?;
        Err(HcsliteError::Unimplemented("pause".into()).into())
    }

    async fn resume(&self, request: Request<ResumeRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        self.resolve_task(&req.id)?;
        Err(HcsliteError::Unimplemented("resume".into()).into())
    }

    async fn checkpoint(
        &self,
        request: Request<CheckpointTaskRequest>,
    ) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        self.resolve_task(&req.id)?;
        Err(HcsliteError::Unimplemented("checkpoint".into()).into())
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        info!(
            task_id = %req.id,
            exec_id = %req.exec_id,
            signal = req.signal,
            all = req.all,
            "kill request"
        );

        let task = self.resolve_task(&req.id)?;
        task.kill_exec(&req.exec_id, req.signal, req.all).await?;
        Ok(Response::new(()))
    }

    async fn exec(&self, request: Request<ExecProcessRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        info!(task_id = %req.id, exec_id = %req.exec_id, "exec request");

        let task = self.resolve_task(&req.id)?;
        let spec = decode_process_spec(req.spec.as_ref())?;
        let stdio = StdioSet::new(req.stdin, req.stdout, req.stderr, req.terminal)?;
        task.create_exec(&req.exec_id, spec, stdio).await?;

        self.publisher
            .publish(&TaskExecAdded {
                task_id: req.id,
                exec_id: req.exec_id,
            })
            .await;

        Ok(Response::new(()))
    }

    async fn resize_pty(&self, request: Request<ResizePtyRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        let exec = task.get_exec(&req.exec_id)?;
        exec.resize_pty(req.width as u16, req.height as u16).await?;
        Ok(Response::new(()))
    }

    async fn close_io(&self, request: Request<CloseIoRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        let exec = task.get_exec(&req.exec_id)?;
        if req.stdin {
            exec.close_io().await?;
        }
        Ok(Response::new(()))
    }

    async fn update(&self, request: Request<UpdateTaskRequest>) -> Result<Response<()>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        let resources = req.resources.as_ref().ok_or_else(|| {
            Status::from(HcsliteError::InvalidArgument("resources are required".into()))
        })?;
        task.update(resources).await?;
        Ok(Response::new(()))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();
        debug!(task_id = %req.id, exec_id = %req.exec_id, "wait request");

        let task = self.resolve_task(&req.id)?;
        let exec = task.get_exec(&req.exec_id)?;
        let status = exec.wait().await;

        Ok(Response::new(WaitResponse {
            exit_status: status.exit_code,
            exited_at: Some(time::to_proto(status.exited_at)),
        }))
    }

    async fn stats(
        &self,
        request: Request<StatsRequest>,
    ) -> Result<Response<StatsResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        let stats = task.stats().await?;
        let value = serde_json::to_vec(&stats)
            .map_err(|err| Status::from(HcsliteError::Internal(format!("encoding stats: {err}"))))?;

        Ok(Response::new(StatsResponse {
            stats: Some(prost_types::Any {
                type_url: "types.hcslite.io/hcslite.stats.v1.TaskStats".to_string(),
                value,
            }),
        }))
    }

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        let _guard = self.guard()?;
        let req = request.into_inner();

        let task = self.resolve_task(&req.id)?;
        let task_pid = task.get_exec("")?.pid().await;

        Ok(Response::new(ConnectResponse {
            shim_pid: std::process::id(),
            task_pid,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn shutdown(
        &self,
        request: Request<hcslite_shared::ShutdownRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        info!(task_id = %req.id, now = req.now, "shutdown request");

        let guard = match self.shutdown.guard() {
            Some(guard) => guard,
            // Already draining: shutdown is idempotent.
            None => return Ok(Response::new(())),
        };

        let occupied = matches!(&*self.slot.lock(), TaskSlot::Occupied(_));
        if !req.now && occupied {
            // The manager deletes the task first; nothing to drain yet.
            drop(guard);
            return Ok(Response::new(()));
        }

        self.shutdown.begin();

        let coordinator = Arc::clone(&self.shutdown);
        let slot = Arc::clone(&self.slot);
        let now = req.now;
        tokio::spawn(async move {
            coordinator.drain().await;
            if now {
                let task = match &*slot.lock() {
                    TaskSlot::Occupied(task) => Some(Arc::clone(task)),
                    _ => None,
                };
                if let Some(task) = task {
                    task.force_teardown().await;
                }
            }
            coordinator.complete();
        });

        drop(guard);
        Ok(Response::new(()))
    }
}

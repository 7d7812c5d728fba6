//! RPC-surface properties: id resolution, unsupported operations,
//! payload validation, shutdown gating, and event plumbing.

mod common;

use common::{fixture, process_spec, sandbox_fixture, within};
use hcslite::compute::TaskStats;
use hcslite::events::topics;
use hcslite_shared::Task as TaskRpc;
use hcslite_shared::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, CreateTaskRequest, DeleteRequest,
    ExecProcessRequest, KillRequest, PauseRequest, PidsRequest, ResizePtyRequest, ResumeRequest,
    ShutdownRequest, StartRequest, StateRequest, StatsRequest, UpdateTaskRequest, WaitRequest,
};
use prost::Message;
use tonic::{Code, Request};

async fn create_task(fx: &common::Fixture) {
    fx.service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            ..Default::default()
        }))
        .await
        .expect("create task");
}

#[tokio::test]
async fn unknown_task_id_is_not_found_everywhere() {
    let fx = fixture("t1");
    create_task(&fx).await;

    macro_rules! expect_not_found {
        ($call:expr) => {
            assert_eq!($call.await.unwrap_err().code(), Code::NotFound)
        };
    }

    expect_not_found!(fx.service.state(Request::new(StateRequest {
        id: "other".into(),
        exec_id: String::new(),
    })));
    expect_not_found!(fx.service.start(Request::new(StartRequest {
        id: "other".into(),
        exec_id: String::new(),
    })));
    expect_not_found!(fx.service.delete(Request::new(DeleteRequest {
        id: "other".into(),
        exec_id: String::new(),
    })));
    expect_not_found!(fx.service.pids(Request::new(PidsRequest { id: "other".into() })));
    expect_not_found!(fx.service.kill(Request::new(KillRequest {
        id: "other".into(),
        exec_id: String::new(),
        signal: 9,
        all: false,
    })));
    expect_not_found!(fx.service.wait(Request::new(WaitRequest {
        id: "other".into(),
        exec_id: String::new(),
    })));
    expect_not_found!(fx.service.stats(Request::new(StatsRequest { id: "other".into() })));
    expect_not_found!(fx.service.update(Request::new(UpdateTaskRequest {
        id: "other".into(),
        resources: None,
    })));
}

#[tokio::test]
async fn create_is_set_once() {
    let fx = fixture("t1");
    create_task(&fx).await;

    let err = fx
        .service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn failed_create_leaves_no_task_state() {
    let fx = fixture("t1");
    fx.controller.fail_next_create();

    let err = fx
        .service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // The slot is still vacant: lookups miss, and a retry succeeds.
    let err = fx
        .service
        .state(Request::new(StateRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    create_task(&fx).await;
}

#[tokio::test]
async fn terminal_with_stderr_is_invalid() {
    let fx = fixture("t1");
    let err = fx
        .service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            terminal: true,
            stderr: "/tmp/err.sock".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn pause_resume_checkpoint_are_unimplemented() {
    let fx = fixture("t1");
    create_task(&fx).await;

    let err = fx
        .service
        .pause(Request::new(PauseRequest {
            id: fx.task_id.clone(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = fx
        .service
        .resume(Request::new(ResumeRequest {
            id: fx.task_id.clone(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = fx
        .service
        .checkpoint(Request::new(CheckpointTaskRequest {
            id: fx.task_id.clone(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn exec_id_validation() {
    let fx = fixture("t1");
    create_task(&fx).await;

    // Before init runs, execs cannot be added.
    let err = fx
        .service
        .exec(Request::new(ExecProcessRequest {
            id: fx.task_id.clone(),
            exec_id: "e2".into(),
            spec: Some(process_spec()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    fx.service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    // Empty exec id is reserved for init.
    let err = fx
        .service
        .exec(Request::new(ExecProcessRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
            spec: Some(process_spec()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Duplicate ids collide.
    for expected in [None, Some(Code::AlreadyExists)] {
        let result = fx
            .service
            .exec(Request::new(ExecProcessRequest {
                id: fx.task_id.clone(),
                exec_id: "e2".into(),
                spec: Some(process_spec()),
                ..Default::default()
            }))
            .await;
        match expected {
            None => assert!(result.is_ok()),
            Some(code) => assert_eq!(result.unwrap_err().code(), code),
        }
    }
}

#[tokio::test]
async fn resource_update_payloads_are_filtered() {
    let fx = fixture("t1");
    create_task(&fx).await;

    // An arbitrary message type is rejected with the unsupported marker.
    let bogus = prost_types::Any {
        type_url: "types.hcslite.io/opencontainers/runtime-spec/1/Process".into(),
        value: Vec::new(),
    };
    let err = fx
        .service
        .update(Request::new(UpdateTaskRequest {
            id: fx.task_id.clone(),
            resources: Some(bogus),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("not supported"), "{}", err.message());

    // Windows limits go through to the backend.
    let resources = hcslite_shared::WindowsResources {
        memory_limit_bytes: 100,
        ..Default::default()
    };
    fx.service
        .update(Request::new(UpdateTaskRequest {
            id: fx.task_id.clone(),
            resources: Some(prost_types::Any {
                type_url: "types.hcslite.io/hcslite.v1.WindowsResources".into(),
                value: resources.encode_to_vec(),
            }),
        }))
        .await
        .expect("windows resources accepted");
    assert_eq!(fx.controller.modifications(&fx.task_id), 1);
}

#[tokio::test]
async fn resize_requires_a_running_terminal_exec() {
    let fx = fixture("t1");
    create_task(&fx).await;
    fx.service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    // The init exec was created without a terminal.
    let err = fx
        .service
        .resize_pty(Request::new(ResizePtyRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
            width: 80,
            height: 25,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn close_io_reaches_the_backend() {
    let fx = fixture("t1");
    create_task(&fx).await;
    let pid = fx
        .service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .pid;

    fx.service
        .close_io(Request::new(CloseIoRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
            stdin: true,
        }))
        .await
        .expect("close io");
    assert!(fx.controller.stdin_closed(pid));
}

#[tokio::test]
async fn stats_carry_flavor_specific_structure() {
    let fx = fixture("t1");
    create_task(&fx).await;

    let stats = fx
        .service
        .stats(Request::new(StatsRequest {
            id: fx.task_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .stats
        .expect("stats payload");

    assert!(stats.type_url.contains("TaskStats"));
    let decoded: TaskStats = serde_json::from_slice(&stats.value).unwrap();
    assert_eq!(decoded.container.memory.working_set_bytes, 4096);
    assert!(decoded.vm.is_none());
}

#[tokio::test]
async fn connect_reports_shim_and_task_pids() {
    let fx = fixture("t1");
    create_task(&fx).await;
    let pid = fx
        .service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .pid;

    let info = fx
        .service
        .connect(Request::new(ConnectRequest {
            id: fx.task_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.shim_pid, std::process::id());
    assert_eq!(info.task_pid, pid);
    assert!(!info.version.is_empty());
}

#[tokio::test]
async fn oom_notifications_become_events() {
    let fx = fixture("t1");
    create_task(&fx).await;
    fx.service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    fx.controller.report_oom(&fx.task_id);

    within(async {
        loop {
            if fx.topics().iter().any(|t| t == topics::TASK_OOM) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn shutdown_gates_subsequent_handlers() {
    let fx = fixture("t1");
    // No task: shutdown drains immediately.
    fx.service
        .shutdown(Request::new(ShutdownRequest {
            id: fx.task_id.clone(),
            now: false,
        }))
        .await
        .expect("shutdown");

    within(fx.service.shutdown_coordinator().done()).await;

    let err = fx
        .service
        .state(Request::new(StateRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    // A second shutdown is an idempotent no-op.
    fx.service
        .shutdown(Request::new(ShutdownRequest {
            id: fx.task_id.clone(),
            now: false,
        }))
        .await
        .expect("second shutdown");
}

#[tokio::test]
async fn graceful_shutdown_defers_to_task_deletion() {
    let fx = fixture("t1");
    create_task(&fx).await;

    // now=false with a live task: the manager must delete first, so this
    // is a no-op and handlers keep working.
    fx.service
        .shutdown(Request::new(ShutdownRequest {
            id: fx.task_id.clone(),
            now: false,
        }))
        .await
        .expect("deferred shutdown");
    assert!(!fx.service.shutdown_coordinator().is_draining());

    fx.service
        .pids(Request::new(PidsRequest {
            id: fx.task_id.clone(),
        }))
        .await
        .expect("handlers still admitted");
}

#[tokio::test]
async fn immediate_shutdown_tears_the_task_down() {
    let fx = fixture("t1");
    create_task(&fx).await;
    fx.service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    fx.service
        .shutdown(Request::new(ShutdownRequest {
            id: fx.task_id.clone(),
            now: true,
        }))
        .await
        .expect("shutdown now");

    within(fx.service.shutdown_coordinator().done()).await;
    assert!(fx.controller.system_terminated(&fx.task_id));
}

#[tokio::test]
async fn deleted_marker_is_written_on_init_delete() {
    let fx = fixture("t1");
    create_task(&fx).await;
    let pid = fx
        .service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .pid;

    fx.controller.exit_process(pid, 3);
    within(fx.service.wait(Request::new(WaitRequest {
        id: fx.task_id.clone(),
        exec_id: String::new(),
    })))
    .await
    .unwrap();

    fx.service
        .delete(Request::new(DeleteRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .expect("delete");

    let marker = hcslite::bootstrap::read_deleted_marker(fx.bundle.path())
        .expect("marker written");
    assert_eq!(marker.pid, pid);
    assert_eq!(marker.exit_code, 3);
}

#[tokio::test]
async fn sandbox_tasks_reject_execs_and_track_the_vm() {
    let fx = sandbox_fixture("p1");
    create_task(&fx).await;

    let pid = fx
        .service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .pid;
    assert!(pid > 0);

    // No workload of its own: execs are rejected.
    let err = fx
        .service
        .exec(Request::new(ExecProcessRequest {
            id: fx.task_id.clone(),
            exec_id: "e2".into(),
            spec: Some(process_spec()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // The VM going away resolves the sandbox's init.
    fx.controller.exit_system(&fx.task_id);
    let waited = within(fx.service.wait(Request::new(WaitRequest {
        id: fx.task_id.clone(),
        exec_id: String::new(),
    })))
    .await
    .unwrap()
    .into_inner();
    assert_eq!(waited.exit_status, 0);

    fx.service
        .delete(Request::new(DeleteRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .expect("delete sandbox");

    assert_eq!(
        fx.topics(),
        vec![
            topics::TASK_CREATE,
            topics::TASK_START,
            topics::TASK_EXIT,
            topics::TASK_DELETE,
        ]
    );
}

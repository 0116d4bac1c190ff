use simsched::{
    distributed::RemoteError, resources::CoreSampler, scheduler::Phase, ExecutorError, JobSpec,
    JobStatus, PoolConfig, Scheduler, SchedulerError, SchedulerOptions, WorkerConfig,
};
use std::{
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn local_pool(slots: usize, free: usize) -> Scheduler {
    Scheduler::new(
        Path::new("."),
        vec![WorkerConfig::Local; slots],
        SchedulerOptions {
            wait: Duration::from_millis(20),
            max_attempts: Some(3),
            sampler: CoreSampler::Fixed(free),
        },
    )
}

#[test]
fn third_job_reuses_an_existing_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(2, 4);
    let job = |name: &str| {
        JobSpec::new(["sleep", "2"], dir.path().join(name))
            .unwrap()
            .with_cores(1)
    };

    let first = scheduler.submit(job("a")).unwrap();
    assert_eq!(scheduler.live_workers(), 1);

    let second = scheduler.submit(job("b")).unwrap();
    assert_eq!(scheduler.live_workers(), 2);
    assert!(!Arc::ptr_eq(first.executor(), second.executor()));
    assert_eq!(scheduler.phase(), Phase::Saturated);

    let third = scheduler.submit(job("c")).unwrap();
    assert_eq!(scheduler.live_workers(), 2);
    assert!(Arc::ptr_eq(first.executor(), third.executor()));
    assert_eq!(scheduler.active_jobs().len(), 3);
}

#[test]
fn oversized_job_keeps_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(1, 4);
    let job = JobSpec::new(["true"], dir.path().join("huge"))
        .unwrap()
        .with_cores(64);

    let start = Instant::now();
    let result = scheduler.submit(job);

    assert!(matches!(
        result,
        Err(SchedulerError::NoCapacity { attempts: 3 })
    ));
    // two pauses between the three passes
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(scheduler.active_jobs().is_empty());
    assert!(!dir.path().join("huge").exists());
}

#[test]
fn echo_job_completes_with_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(1, 0);
    let handle = scheduler
        .submit(
            JobSpec::new(["echo", "hello"], dir.path().join("echo"))
                .unwrap()
                .with_cores(0),
        )
        .unwrap();

    let mut status = handle.status().unwrap();
    while status == JobStatus::Running {
        thread::sleep(Duration::from_millis(10));
        status = handle.status().unwrap();
    }

    assert_eq!(status, JobStatus::Done);
    assert_eq!(handle.get_stdout().unwrap(), "hello\n");
}

#[test]
fn never_more_workers_than_slots() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(3, 16);

    for index in 0..8 {
        let job = JobSpec::new(["sleep", "1"], dir.path().join(index.to_string()))
            .unwrap()
            .with_cores(1);
        scheduler.submit(job).unwrap();

        assert!(scheduler.live_workers() <= 3);
    }
    assert_eq!(scheduler.live_workers(), 3);
}

#[test]
fn finished_jobs_move_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(1, 2);
    let handle = scheduler
        .submit(JobSpec::new(["true"], dir.path().join("quick")).unwrap())
        .unwrap();

    while !handle.status().unwrap().is_finished() {
        thread::sleep(Duration::from_millis(10));
    }
    let busy = scheduler.refresh().unwrap();

    assert!(busy.is_empty());
    assert!(scheduler.active_jobs().is_empty());
    assert_eq!(scheduler.completed_jobs().len(), 1);
}

#[test]
fn idle_worker_is_reused_before_creating_another() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(2, 4);

    let first = scheduler
        .submit(JobSpec::new(["true"], dir.path().join("one")).unwrap())
        .unwrap();
    while !first.status().unwrap().is_finished() {
        thread::sleep(Duration::from_millis(10));
    }

    let second = scheduler
        .submit(JobSpec::new(["true"], dir.path().join("two")).unwrap())
        .unwrap();

    assert_eq!(scheduler.live_workers(), 1);
    assert!(Arc::ptr_eq(first.executor(), second.executor()));
}

#[test]
fn invalid_slot_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new(
        Path::new("."),
        vec![WorkerConfig::Remote {
            host: String::new(),
            executable: "simsched".into(),
            working_dir: None,
            testing: true,
        }],
        SchedulerOptions::default(),
    );

    let result = scheduler.submit(JobSpec::new(["true"], dir.path().join("x")).unwrap());

    assert!(matches!(result, Err(SchedulerError::Config(_))));
    assert_eq!(scheduler.live_workers(), 0);
}

#[test]
fn unreachable_runtime_is_an_executor_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new(
        Path::new("."),
        vec![WorkerConfig::Remote {
            host: "localhost".into(),
            executable: dir.path().join("missing/simsched"),
            working_dir: None,
            testing: true,
        }],
        SchedulerOptions::default(),
    );

    let result = scheduler.submit(JobSpec::new(["true"], dir.path().join("x")).unwrap());

    assert!(matches!(
        result,
        Err(SchedulerError::Executor(ExecutorError::Remote(
            RemoteError::Spawn { .. }
        )))
    ));
    assert_eq!(scheduler.live_workers(), 0);
}

#[test]
fn idle_worker_is_preferred_over_rotation_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = local_pool(2, 8);
    let job = |name: &str, command: &[&str]| {
        JobSpec::new(command.iter().copied(), dir.path().join(name))
            .unwrap()
            .with_cores(1)
    };

    let long = scheduler.submit(job("long", &["sleep", "5"])).unwrap();
    let quick = scheduler.submit(job("quick", &["true"])).unwrap();
    assert_eq!(scheduler.phase(), Phase::Saturated);
    assert!(!Arc::ptr_eq(long.executor(), quick.executor()));

    let mut previous = quick;
    for name in ["next", "after"] {
        while !previous.status().unwrap().is_finished() {
            thread::sleep(Duration::from_millis(10));
        }

        let next = scheduler.submit(job(name, &["true"])).unwrap();
        assert!(Arc::ptr_eq(next.executor(), previous.executor()));
        assert!(!Arc::ptr_eq(next.executor(), long.executor()));
        previous = next;
    }
}

#[test]
fn remote_slot_runs_through_a_dispatcher() {
    let remote_root = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new(
        Path::new("."),
        vec![WorkerConfig::Remote {
            host: "localhost".into(),
            executable: env!("CARGO_BIN_EXE_simsched").into(),
            working_dir: Some(remote_root.path().to_path_buf()),
            testing: true,
        }],
        SchedulerOptions::default(),
    );

    let handle = scheduler
        .submit(JobSpec::new(["echo", "from afar"], "run0").unwrap().with_cores(0))
        .unwrap();
    while handle.status().unwrap() == JobStatus::Running {
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(handle.host(), "localhost");
    assert_eq!(handle.get_stdout().unwrap(), "from afar\n");
    assert!(remote_root.path().join("run0/stderr.txt").exists());
}

#[test]
fn pool_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.json");
    let mut scheduler = local_pool(1, 1);
    scheduler.add_worker(WorkerConfig::Remote {
        host: "node02".into(),
        executable: "/opt/simsched".into(),
        working_dir: None,
        testing: false,
    });
    scheduler.save(&path).unwrap();

    let mut restored = local_pool(0, 1);
    restored.load(&path).unwrap();

    assert_eq!(restored.config(), scheduler.config());
    assert_eq!(PoolConfig::load(&path).unwrap().workers.len(), 2);
    assert_eq!(restored.phase(), Phase::Filling);
}

//! Integration tests for dependency discovery and stream placement.

use std::sync::Arc;

use kernelflow::prelude::*;
use kernelflow_cpu::CpuCall;

fn context_with(config: SchedulerConfig) -> (Arc<CpuRuntime>, ExecutionContext) {
    let runtime = Arc::new(CpuRuntime::new());
    let ctx = ExecutionContext::new(runtime.clone(), config).expect("Failed to create context");
    (runtime, ctx)
}

fn writer(name: &str, array: ArrayHandle) -> KernelLaunch {
    KernelLaunch::new(name).grid(4).block(64).output(array)
}

fn reader(name: &str, array: ArrayHandle) -> KernelLaunch {
    KernelLaunch::new(name).grid(4).block(64).input(array)
}

fn parents(ctx: &ExecutionContext, handle: &CompletionHandle) -> Vec<ElementId> {
    ctx.element(handle.element())
        .expect("element should still be live")
        .dependencies()
        .iter()
        .map(|d| d.parent)
        .collect()
}

fn stream_of(ctx: &ExecutionContext, handle: &CompletionHandle) -> ExecutionStream {
    ctx.element(handle.element())
        .and_then(|e| e.stream())
        .expect("element should have a stream")
}

/// Write, write, read on one array yields a chain, not a fan-in.
#[test]
fn test_write_write_read_chain() {
    let (_runtime, mut ctx) = context_with(SchedulerConfig::default());
    let x = ctx.allocate_array(1024).unwrap();

    let k1 = ctx.submit(writer("k1", x)).unwrap();
    let k2 = ctx.submit(writer("k2", x)).unwrap();
    let k3 = ctx.submit(reader("k3", x)).unwrap();

    assert!(parents(&ctx, &k1).is_empty());
    assert_eq!(parents(&ctx, &k2), vec![k1.element()]);
    assert_eq!(parents(&ctx, &k3), vec![k2.element()]);

    let k2_args = &ctx.element(k2.element()).unwrap().dependencies()[0].arguments;
    assert_eq!(k2_args.len(), 1);
    assert_eq!(k2_args[0].array_id(), Some(x.id()));

    // Transitive ordering keeps the chain on one stream.
    assert_eq!(stream_of(&ctx, &k1), stream_of(&ctx, &k3));

    ctx.synchronize(SyncTarget::All).unwrap();
    assert!(k1.is_finished() && k2.is_finished() && k3.is_finished());
}

/// Independent elements run on distinct streams and finish on synchronize.
#[test]
fn test_disjoint_arguments_use_distinct_streams() {
    for reversed in [false, true] {
        let (runtime, mut ctx) = context_with(SchedulerConfig::default());
        let a = ctx.allocate_array(256).unwrap();
        let b = ctx.allocate_array(256).unwrap();
        let (first, second) = if reversed { (b, a) } else { (a, b) };

        let h1 = ctx.submit(writer("first", first)).unwrap();
        let h2 = ctx.submit(writer("second", second)).unwrap();

        assert!(parents(&ctx, &h1).is_empty());
        assert!(parents(&ctx, &h2).is_empty());
        assert_ne!(stream_of(&ctx, &h1), stream_of(&ctx, &h2));
        assert_eq!(runtime.stats().streams_created, 2);
        assert!(!h1.is_finished());

        ctx.synchronize(SyncTarget::All).unwrap();
        assert!(h1.is_finished());
        assert!(h2.is_finished());
        assert_eq!(ctx.live_elements(), 0);
        assert!(ctx.frontier().is_empty());
    }
}

/// Readers of a shared array do not order each other under the const-aware policy.
#[test]
fn test_const_aware_readers_are_independent() {
    let config = SchedulerConfigBuilder::new()
        .dependency_policy(DependencyPolicy::WithConst)
        .build()
        .unwrap();
    let (_runtime, mut ctx) = context_with(config);
    let x = ctx.allocate_array(512).unwrap();

    let w = ctx.submit(writer("w", x)).unwrap();
    let r1 = ctx.submit(reader("r1", x)).unwrap();
    let r2 = ctx.submit(reader("r2", x)).unwrap();

    assert_eq!(parents(&ctx, &r1), vec![w.element()]);
    assert_eq!(parents(&ctx, &r2), vec![w.element()]);

    // A later write orders after the writer and both readers.
    let w2 = ctx.submit(writer("w2", x)).unwrap();
    let mut p = parents(&ctx, &w2);
    p.sort();
    assert_eq!(p, vec![w.element(), r1.element(), r2.element()]);
}

/// Under the default policy a read still consumes the shared array.
#[test]
fn test_default_policy_orders_readers() {
    let (_runtime, mut ctx) = context_with(SchedulerConfig::default());
    let x = ctx.allocate_array(512).unwrap();

    let w = ctx.submit(writer("w", x)).unwrap();
    let r1 = ctx.submit(reader("r1", x)).unwrap();
    let r2 = ctx.submit(reader("r2", x)).unwrap();

    assert_eq!(parents(&ctx, &r1), vec![w.element()]);
    assert_eq!(parents(&ctx, &r2), vec![r1.element()]);
}

/// The disjoint parent policy forks readers onto a new stream with an event wait.
#[test]
fn test_disjoint_parent_policy_inserts_event_wait() {
    let config = SchedulerConfigBuilder::new()
        .dependency_policy(DependencyPolicy::WithConst)
        .parent_stream_policy(ParentStreamPolicy::Disjoint)
        .build()
        .unwrap();
    let (runtime, mut ctx) = context_with(config);
    let x = ctx.allocate_array(512).unwrap();

    let w = ctx.submit(writer("w", x)).unwrap();
    let r1 = ctx.submit(reader("r1", x)).unwrap();
    let r2 = ctx.submit(reader("r2", x)).unwrap();

    let s_w = stream_of(&ctx, &w);
    assert_eq!(stream_of(&ctx, &r1), s_w);
    let s_r2 = stream_of(&ctx, &r2);
    assert_ne!(s_r2, s_w);

    let waits: Vec<CpuCall> = runtime
        .calls()
        .into_iter()
        .filter(|c| matches!(c, CpuCall::WaitEvent { .. }))
        .collect();
    assert_eq!(waits.len(), 1);
    match &waits[0] {
        CpuCall::WaitEvent { stream, .. } => assert_eq!(Some(*stream), s_r2.handle()),
        other => panic!("unexpected call {:?}", other),
    }
    assert_eq!(ctx.stats().event_waits, 1);
}

/// A child on another stream than its parent waits on the parent's event.
#[test]
fn test_cross_stream_child_waits_on_parent() {
    let (runtime, mut ctx) = context_with(SchedulerConfig::default());
    let a = ctx.allocate_array(128).unwrap();
    let b = ctx.allocate_array(128).unwrap();

    let ka = ctx.submit(writer("ka", a)).unwrap();
    let kb = ctx.submit(writer("kb", b)).unwrap();
    let join = ctx
        .submit(
            KernelLaunch::new("join")
                .grid(1)
                .block(32)
                .input(a)
                .input(b)
                .output(a),
        )
        .unwrap();

    let mut p = parents(&ctx, &join);
    p.sort();
    assert_eq!(p, vec![ka.element(), kb.element()]);

    // Continues on the first parent's stream and waits on the other one.
    assert_eq!(stream_of(&ctx, &join), stream_of(&ctx, &ka));
    let waits = runtime
        .calls()
        .into_iter()
        .filter(|c| matches!(c, CpuCall::WaitEvent { .. }))
        .count();
    assert_eq!(waits, 1);
}

/// The synchronous policy completes every element before the next is placed.
#[test]
fn test_sync_policy_uses_default_stream() {
    let config = SchedulerConfig {
        record_dag: true,
        ..SchedulerConfig::sync()
    };
    let (runtime, mut ctx) = context_with(config);
    let x = ctx.allocate_array(64).unwrap();
    let y = ctx.allocate_array(64).unwrap();

    for name in ["a", "b", "c"] {
        let handle = ctx.submit(writer(name, x)).unwrap();
        assert!(handle.is_finished());
        assert_eq!(ctx.live_elements(), 0);
    }
    let handle = ctx.submit(writer("d", y)).unwrap();
    assert!(handle.is_finished());

    assert_eq!(runtime.stats().streams_created, 0);
    let dag = ctx.dag().unwrap();
    assert_eq!(dag.vertices().len(), 4);
    assert!(dag
        .vertices()
        .iter()
        .all(|v| v.stream == "default stream of device 0"));
    assert_eq!(ctx.stats().host_synchronizations, 4);
}

/// Scheduling an element twice is rejected.
#[test]
fn test_double_schedule_is_rejected() {
    let (_runtime, mut ctx) = context_with(SchedulerConfig::default());
    let x = ctx.allocate_array(64).unwrap();
    let id = ctx.register(writer("k", x));
    assert_eq!(
        ctx.element(id).unwrap().state(),
        ElementState::Created
    );

    ctx.schedule(id).unwrap();
    assert!(matches!(
        ctx.schedule(id),
        Err(KernelFlowError::AlreadyScheduled(e)) if e == id
    ));

    ctx.synchronize(SyncTarget::All).unwrap();
    assert!(matches!(
        ctx.schedule(id),
        Err(KernelFlowError::AlreadyScheduled(_))
    ));
    assert!(matches!(
        ctx.schedule(ElementId(999)),
        Err(KernelFlowError::UnknownElement(_))
    ));
}

/// An element without operands never orders anything.
#[test]
fn test_empty_argument_list_has_no_dependencies() {
    let (_runtime, mut ctx) = context_with(SchedulerConfig::default());
    let x = ctx.allocate_array(64).unwrap();
    ctx.submit(writer("before", x)).unwrap();

    let id = ctx.register(KernelLaunch::new("noop").grid(1).block(1));
    assert!(!ctx.element(id).unwrap().has_possible_dependencies());
    let handle = ctx.schedule(id).unwrap();
    assert!(parents(&ctx, &handle).is_empty());
    assert!(!ctx.frontier().contains(&handle.element()));
}

/// Whether `ancestor` can be reached from `element` along recorded edges.
fn reaches(dag: &ExecutionDag, element: ElementId, ancestor: ElementId) -> bool {
    let mut stack = vec![element];
    let mut seen = Vec::new();
    while let Some(node) = stack.pop() {
        if node == ancestor {
            return true;
        }
        if seen.contains(&node) {
            continue;
        }
        seen.push(node);
        stack.extend(dag.parents_of(node));
    }
    false
}

fn conflicts(policy: DependencyPolicy, a: &[ArgumentDescriptor], b: &[ArgumentDescriptor]) -> bool {
    a.iter().any(|x| {
        b.iter().any(|y| {
            x.identity() == y.identity()
                && (policy == DependencyPolicy::Default || !x.is_const() || !y.is_const())
        })
    })
}

/// Every pair of elements sharing a mutable array is ordered, never both ways.
#[test]
fn test_conflicting_elements_are_ordered() {
    for policy in [DependencyPolicy::Default, DependencyPolicy::WithConst] {
        let config = SchedulerConfigBuilder::new()
            .dependency_policy(policy)
            .record_dag(true)
            .build()
            .unwrap();
        let (_runtime, mut ctx) = context_with(config);
        let arrays: Vec<ArrayHandle> = (0..4).map(|_| ctx.allocate_array(64).unwrap()).collect();

        // Deterministic pseudo-random program.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut program: Vec<(ElementId, Vec<ArgumentDescriptor>)> = Vec::new();
        for i in 0..40 {
            let mut launch = KernelLaunch::new(format!("k{}", i)).grid(1).block(32);
            let mut args = Vec::new();
            for array in &arrays {
                match next() % 3 {
                    0 => {}
                    1 => args.push(ArgumentDescriptor::const_array(*array)),
                    _ => args.push(ArgumentDescriptor::mut_array(*array)),
                }
            }
            for arg in &args {
                launch = launch.arg(*arg);
            }
            let handle = ctx.submit(launch).unwrap();
            program.push((handle.element(), args));
        }

        let dag = ctx.dag().unwrap();
        for edge in dag.edges() {
            assert!(edge.parent < edge.child, "edge against program order");
        }

        for (i, (older, older_args)) in program.iter().enumerate() {
            for (newer, newer_args) in &program[i + 1..] {
                if conflicts(policy, older_args, newer_args) {
                    assert!(
                        reaches(dag, *newer, *older),
                        "{:?}: {} not ordered before {}",
                        policy,
                        older,
                        newer
                    );
                }
                assert!(!reaches(dag, *older, *newer));
            }
        }
    }
}

struct Submitted {
    handle: CompletionHandle,
    args: Vec<ArgumentDescriptor>,
    failing: bool,
}

/// Scheduler bookkeeping holds after every step of a mixed program.
fn assert_consistent(ctx: &ExecutionContext, program: &[Submitted]) {
    let pending = program.iter().filter(|s| !s.handle.is_finished()).count();
    assert_eq!(ctx.live_elements(), pending);
    for id in ctx.frontier() {
        assert!(ctx.element(*id).is_some(), "retired element {} in frontier", id);
    }
    for pool in ctx.stats().pools {
        assert_eq!(pool.free + pool.busy, pool.created);
    }
}

/// Random kernels interleaved with host reads, synchronizations and failing
/// launches stay ordered and keep the pools consistent.
#[test]
fn test_mixed_program_stays_ordered() {
    for policy in [DependencyPolicy::Default, DependencyPolicy::WithConst] {
        let config = SchedulerConfigBuilder::new()
            .dependency_policy(policy)
            .record_dag(true)
            .build()
            .unwrap();
        let runtime = Arc::new(CpuRuntime::with_devices(2));
        let mut ctx = ExecutionContext::new(runtime.clone(), config).unwrap();
        let arrays: Vec<ArrayHandle> = (0..4).map(|_| ctx.allocate_array(64).unwrap()).collect();

        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut program: Vec<Submitted> = Vec::new();
        for step in 0..80 {
            match next() % 10 {
                0 => {
                    let array = arrays[(next() % 4) as usize];
                    ctx.synchronize(SyncTarget::Array(array)).unwrap();
                    for s in &program {
                        if s.args.iter().any(|a| a.array_id() == Some(array.id())) {
                            assert!(s.handle.is_finished(), "step {}: user of array left live", step);
                        }
                    }
                }
                1 if step % 3 == 0 => {
                    ctx.synchronize(SyncTarget::All).unwrap();
                    assert_eq!(ctx.live_elements(), 0);
                    assert!(ctx.frontier().is_empty());
                    assert!(ctx.stats().pools.iter().all(|p| p.busy == 0));
                }
                1 | 2 => {
                    let array = arrays[(next() % 4) as usize];
                    let args = vec![ArgumentDescriptor::const_array(array)];
                    let handle = ctx.submit(HostArrayAccess::read(array)).unwrap();
                    ctx.wait(&handle).unwrap();
                    for s in &program {
                        if conflicts(policy, &s.args, &args) {
                            assert!(s.handle.is_finished(), "step {}: host read overtook a writer", step);
                        }
                    }
                    program.push(Submitted {
                        handle,
                        args,
                        failing: false,
                    });
                }
                _ => {
                    let failing = next() % 6 == 0;
                    let mut launch = KernelLaunch::new(format!("k{}", step)).grid(1).block(32);
                    let mut args = Vec::new();
                    for array in &arrays {
                        match next() % 3 {
                            0 => {}
                            1 => args.push(ArgumentDescriptor::const_array(*array)),
                            _ => args.push(ArgumentDescriptor::mut_array(*array)),
                        }
                    }
                    for arg in &args {
                        launch = launch.arg(*arg);
                    }
                    if failing {
                        launch = launch.body(|run| {
                            Err(KernelFlowError::launch_failed(run.element(), "kernel fault"))
                        });
                    }

                    let live_conflicts: Vec<ElementId> = program
                        .iter()
                        .filter(|s| !s.handle.is_finished() && conflicts(policy, &s.args, &args))
                        .map(|s| s.handle.element())
                        .collect();
                    let handle = ctx.submit(launch).unwrap();

                    let dag = ctx.dag().unwrap();
                    for older in live_conflicts {
                        assert!(
                            reaches(dag, handle.element(), older),
                            "{:?} step {}: {} not ordered after {}",
                            policy,
                            step,
                            handle.element(),
                            older
                        );
                    }
                    if failing {
                        assert!(matches!(
                            handle.result(),
                            Some(Err(KernelFlowError::LaunchFailed { .. }))
                        ));
                        assert!(ctx.element(handle.element()).is_none());
                        assert!(!ctx.frontier().contains(&handle.element()));
                    }
                    program.push(Submitted {
                        handle,
                        args,
                        failing,
                    });
                }
            }
            assert_consistent(&ctx, &program);
        }

        let dag = ctx.dag().unwrap();
        assert!(dag.edges().iter().all(|e| e.parent < e.child));
        for edge in dag.edges() {
            let parent = program.iter().find(|s| s.handle.element() == edge.parent);
            assert!(
                parent.map_or(true, |p| !p.failing),
                "failed element {} ordered later work",
                edge.parent
            );
        }

        ctx.cleanup().unwrap();
        assert!(program.iter().all(|s| s.handle.is_finished()));
        assert_eq!(runtime.stats().live_streams, 0);
        assert_eq!(runtime.stats().live_events, 0);
    }
}

/// Manual streams still complete synchronously under the SYNC policy.
#[test]
fn test_sync_policy_completes_manual_stream_work() {
    let (runtime, mut ctx) = context_with(SchedulerConfig::sync());
    let x = ctx.allocate_array(64).unwrap();
    let stream = ctx.create_manual_stream(DeviceId(0)).unwrap();

    let first = ctx.submit_on_stream(writer("first", x), stream).unwrap();
    assert!(first.is_finished());
    assert_eq!(ctx.live_elements(), 0);

    let second = ctx.submit_on_stream(reader("second", x), stream).unwrap();
    assert!(second.is_finished());
    assert!(matches!(second.result(), Some(Ok(()))));
    assert_eq!(ctx.live_elements(), 0);
    assert!(ctx.frontier().is_empty());

    let syncs = runtime
        .calls()
        .into_iter()
        .filter(|c| *c == CpuCall::SynchronizeStream(stream.handle()))
        .count();
    assert_eq!(syncs, 2);
    assert_eq!(runtime.stats().live_events, 0);
}

/// With the default configuration independent work spreads over devices.
#[test]
fn test_default_placement_uses_every_device() {
    let runtime = Arc::new(CpuRuntime::with_devices(2));
    let mut ctx = ExecutionContext::new(runtime.clone(), SchedulerConfig::default()).unwrap();
    let a = ctx.allocate_array(64).unwrap();
    let b = ctx.allocate_array(64).unwrap();

    let ka = ctx.submit(writer("a", a)).unwrap();
    let kb = ctx.submit(writer("b", b)).unwrap();
    let da = stream_of(&ctx, &ka).device();
    let db = stream_of(&ctx, &kb).device();
    assert_eq!(da, Some(DeviceId(0)));
    assert_eq!(db, Some(DeviceId(1)));

    // A dependent element follows its parent instead of balancing.
    let kc = ctx.submit(reader("c", b)).unwrap();
    assert_eq!(stream_of(&ctx, &kc), stream_of(&ctx, &kb));

    ctx.synchronize(SyncTarget::All).unwrap();
    let stats = ctx.stats();
    assert_eq!(stats.pools[0].created, 1);
    assert_eq!(stats.pools[1].created, 1);
}

/// Acquire and release keep the number of pooled streams constant.
#[test]
fn test_stream_pool_accounting() {
    let runtime = CpuRuntime::new();
    let mut pool = StreamPool::new(DeviceId(0), None);
    let streams: Vec<Stream> = (0..3).map(|_| pool.create_stream(&runtime).unwrap()).collect();
    for stream in &streams {
        pool.release(stream.id()).unwrap();
    }
    let total = pool.free_count() + pool.busy_count();

    for round in 0..10 {
        let stream = pool.acquire_free_stream().unwrap();
        assert_eq!(pool.free_count() + pool.busy_count(), total);
        if round % 2 == 0 {
            let other = pool.acquire_free_stream().unwrap();
            pool.release(other.id()).unwrap();
        }
        pool.release(stream.id()).unwrap();
        assert_eq!(pool.free_count() + pool.busy_count(), total);
    }
    assert_eq!(pool.created_count(), 3);
    assert_eq!(runtime.stats().streams_created, 3);
}

/// Streams return to the pool once their elements retire.
#[test]
fn test_streams_are_reused_after_synchronize() {
    let (runtime, mut ctx) = context_with(SchedulerConfig::default());
    let arrays: Vec<ArrayHandle> = (0..3).map(|_| ctx.allocate_array(32).unwrap()).collect();

    for round in 0..3 {
        for (i, array) in arrays.iter().enumerate() {
            ctx.submit(writer(&format!("r{}k{}", round, i), *array))
                .unwrap();
        }
        ctx.synchronize(SyncTarget::All).unwrap();
    }

    assert_eq!(runtime.stats().streams_created, 3);
    let stats = ctx.stats();
    let pool = &stats.pools[0];
    assert_eq!(pool.created, 3);
    assert_eq!(pool.busy, 0);
    assert_eq!(pool.total_launches, 9);
}

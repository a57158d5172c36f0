use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    time::{Duration, Instant},
};

use jnistate::{
    get_array_elements, Config, Error, ObjectRef, ReleaseMode, Result, Runtime, ThreadState,
};

const MUTATORS: usize = 4;
const OBJECTS_PER_MUTATOR: usize = 64;
const GC_CYCLES: usize = 8;
const OBJECT_ALIGN: usize = 16;

#[derive(Default)]
struct Stats {
    crossings: AtomicUsize,
    decoded: AtomicUsize,
    cleared: AtomicUsize,
}

fn mutator(runtime: &Runtime, id: usize, barrier: &Barrier, stop: &AtomicBool, stats: &Stats) -> Result<()> {
    runtime.attach_current_thread(Some(&format!("mutator-{}", id)))?;

    let (globals, weaks) = runtime.with_state(ThreadState::Runnable, |guard| -> Result<_> {
        let mut globals = Vec::new();
        let mut weaks = Vec::new();
        for i in 0..OBJECTS_PER_MUTATOR {
            let addr = (id * OBJECTS_PER_MUTATOR + i + 1) * OBJECT_ALIGN;
            let obj = ObjectRef::from_addr(addr).ok_or(Error::NullReference)?;
            globals.push(runtime.new_global_ref(guard, obj)?);
            weaks.push(runtime.new_weak_global_ref(guard, obj)?);
        }
        Ok((globals, weaks))
    })??;
    barrier.wait();

    let mut buffer = vec![0u8; 64];
    while !stop.load(Ordering::Acquire) {
        runtime.with_state(ThreadState::Runnable, |guard| -> Result<()> {
            for (global, weak) in globals.iter().zip(weaks.iter()) {
                let target = guard.decode(*global)?;
                stats.decoded.fetch_add(1, Ordering::Relaxed);
                match guard.decode(*weak) {
                    Ok(decoded) => debug_assert_eq!(decoded.object(), target.object()),
                    Err(err) if err.is_recoverable() => {
                        stats.cleared.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut elements = get_array_elements(guard, &mut buffer)?;
            for byte in elements.as_mut_slice() {
                *byte = byte.wrapping_add(1);
            }
            elements.release(ReleaseMode::CopyBack)?;

            guard.checkpoint();
            guard.blocking(|| std::thread::sleep(Duration::from_micros(50)));
            Ok(())
        })??;
        stats.crossings.fetch_add(1, Ordering::Relaxed);
    }

    runtime.with_state(ThreadState::Runnable, |_| {
        for global in globals {
            runtime.delete_global_ref(global);
        }
        for weak in weaks {
            runtime.delete_weak_global_ref(weak);
        }
    })?;

    runtime.detach_current_thread()
}

fn collector(runtime: &Runtime) -> Result<()> {
    runtime.attach_current_thread(Some("collector"))?;

    for cycle in 0..GC_CYCLES {
        std::thread::sleep(Duration::from_millis(5));
        let world = runtime.suspend_all("demo gc")?;

        // every cycle kills the objects whose index matches the cycle
        let cleared = runtime.sweep_weak_globals(&world, |obj| {
            if (obj.addr() / OBJECT_ALIGN) % GC_CYCLES == cycle {
                None
            } else {
                Some(obj)
            }
        });

        let mut roots = 0;
        runtime.visit_roots(&world, |_, obj| {
            roots += 1;
            obj
        });

        log::info!(
            target: "safepoint",
            "cycle {}: paused {} thread(s), {} root(s), {} weak global(s) cleared in {} us",
            cycle,
            world.threads().len(),
            roots,
            cleared,
            world.elapsed().as_micros()
        );
    }

    runtime.detach_current_thread()
}

fn main() {
    env_logger::init();

    let runtime = Runtime::init(Config::from_env());
    let barrier = Arc::new(Barrier::new(MUTATORS + 1));
    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(Stats::default());
    let start = Instant::now();

    let mutators = (0..MUTATORS)
        .map(|id| {
            let barrier = barrier.clone();
            let stop = stop.clone();
            let stats = stats.clone();
            std::thread::spawn(move || mutator(runtime, id, &barrier, &stop, &stats))
        })
        .collect::<Vec<_>>();

    barrier.wait();
    let collected = collector(runtime);
    stop.store(true, Ordering::Release);

    let mut failed = false;
    if let Err(err) = collected {
        eprintln!("collector failed: {}", err);
        failed = true;
    }

    for (id, handle) in mutators.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                eprintln!("mutator-{} failed: {}", id, err);
                failed = true;
            }
            Err(_) => {
                eprintln!("mutator-{} panicked", id);
                failed = true;
            }
        }
    }

    println!(
        "{} crossings, {} decodes, {} cleared weak globals seen in {} ms (force copy: {})",
        stats.crossings.load(Ordering::Relaxed),
        stats.decoded.load(Ordering::Relaxed),
        stats.cleared.load(Ordering::Relaxed),
        start.elapsed().as_millis(),
        runtime.force_copy_policy().is_force_copy_enabled()
    );
    println!("{}", runtime);

    if failed {
        std::process::exit(1);
    }
}

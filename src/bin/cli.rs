use clap::{App, Arg, ArgMatches, SubCommand};
use memscatter::{
    config::PAGE_SIZE, BufferPoolConfig, LoopbackTransport, Pid, RefreshOption, Result,
    ScatterError, ScatterFlags, Session, SessionConfig,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

/// Longest random request length the stress workload draws
const STRESS_MAX_DRAW: usize = 0x01E0_0000;

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("memscatter-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Memscatter scatter engine CLI Tool")
        .subcommand(
            SubCommand::with_name("stress")
                .about("Hammer a loopback target with random scatter batches")
                .arg(
                    Arg::with_name("workers")
                        .short("w")
                        .long("workers")
                        .value_name("COUNT")
                        .help("Long-lived worker threads")
                        .default_value("8")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("transient")
                        .short("t")
                        .long("transient")
                        .value_name("COUNT")
                        .help("Transient workers kept in flight")
                        .default_value("8")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("How long to run")
                        .default_value("10")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("pages")
                        .short("p")
                        .long("pages")
                        .value_name("PAGES")
                        .help("Physical pages mapped in the loopback target")
                        .default_value("4096")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("status")
                        .long("status")
                        .value_name("SECONDS")
                        .help("Interval between status lines")
                        .default_value("2")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("SEED")
                        .help("Base seed for worker RNGs")
                        .default_value("1")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("chain")
                .about("Resolve a pointer table with a two-round round map")
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("COUNT")
                        .help("Number of pointers in the table")
                        .default_value("16")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("refresh")
                .about("Run refresh schedulers against a loopback target")
                .arg(
                    Arg::with_name("option")
                        .short("o")
                        .long("option")
                        .value_name("OPTION")
                        .help(
                            "Cache category (all, mem, mem-partial, tlb, tlb-partial, \
                             fast, medium, slow)",
                        )
                        .multiple(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("MILLIS")
                        .help("Tick interval; defaults to each option's own")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("How long to run")
                        .default_value("3")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("info").about("Show version and build information"))
        .get_matches();

    match matches.subcommand() {
        ("stress", Some(stress_matches)) => handle_stress(stress_matches),
        ("chain", Some(chain_matches)) => handle_chain(chain_matches),
        ("refresh", Some(refresh_matches)) => handle_refresh(refresh_matches),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .value_of(name)
        .ok_or_else(|| ScatterError::invalid_parameter(name, "Missing value"))?
        .parse()
        .map_err(|_| ScatterError::invalid_parameter(name, "Invalid number format"))
}

#[derive(Debug, Default)]
struct StressCounters {
    batches: AtomicU64,
    reads: AtomicU64,
    failed: AtomicU64,
    transient_spawned: AtomicU64,
}

/// One random batch: 4..4096 page-bounded reads against physical memory
fn run_batch(
    session: &Session,
    pages: &[(u64, u64)],
    rng: &mut SmallRng,
    counters: &StressCounters,
) -> Result<()> {
    let flags = ScatterFlags::from_nocache(rng.random_bool(0.5));
    let set = session.scatter_with_flags(Pid::PHYSICAL, flags)?;

    let count = rng.random_range(4..4096);
    let mut requests = Vec::with_capacity(count);
    for _ in 0..count {
        let (base, remaining) = pages[rng.random_range(0..pages.len())];
        let drawn = rng.random_range(4..STRESS_MAX_DRAW);
        let length = drawn.min(PAGE_SIZE).min(remaining as usize);
        set.prepare_read(base, length)?;
        requests.push((base, length));
    }

    set.execute()?;

    for (address, length) in requests {
        match set.read_pooled(address, length)? {
            Some(buffer) => debug_assert_eq!(buffer.len(), length),
            None => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    counters.reads.fetch_add(count as u64, Ordering::Relaxed);
    counters.batches.fetch_add(1, Ordering::Relaxed);
    set.dispose()
}

fn worker_loop(
    session: Session,
    pages: Arc<Vec<(u64, u64)>>,
    seed: u64,
    stop: Arc<AtomicBool>,
    counters: Arc<StressCounters>,
    batches: Option<u32>,
) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut done = 0u32;
    while !stop.load(Ordering::Relaxed) && batches.map_or(true, |limit| done < limit) {
        if let Err(e) = run_batch(&session, &pages, &mut rng, &counters) {
            log::error!("stress worker batch failed: {}", e);
            break;
        }
        done += 1;
    }
}

fn handle_stress(matches: &ArgMatches) -> Result<()> {
    let workers: usize = parse_arg(matches, "workers")?;
    let transient: usize = parse_arg(matches, "transient")?;
    let duration = Duration::from_secs(parse_arg(matches, "duration")?);
    let page_count: u64 = parse_arg(matches, "pages")?;
    let status_every = Duration::from_secs(parse_arg::<u64>(matches, "status")?.max(1));
    let seed: u64 = parse_arg(matches, "seed")?;

    if page_count == 0 {
        return Err(ScatterError::invalid_parameter("pages", "Need at least one page"));
    }

    let transport = Arc::new(LoopbackTransport::new());
    // Two physical runs with a one-page hole between them
    let half = page_count.div_ceil(2) * PAGE_SIZE as u64;
    transport.map_region(Pid::PHYSICAL, 0x10_0000, half);
    transport.map_region(
        Pid::PHYSICAL,
        0x10_0000 + half + PAGE_SIZE as u64,
        page_count * PAGE_SIZE as u64 - half,
    );
    transport.set_execute_delay(Duration::from_micros(50));

    let session = Session::with_config(transport.clone(), SessionConfig::new("stress"))?;
    let pages = Arc::new(session.phys_mem_pages()?);
    if pages.is_empty() {
        return Err(ScatterError::invalid_parameter(
            "pages",
            "No readable page list; map at least two pages per run",
        ));
    }
    println!(
        "Stress test: {} physical page(s), {} worker(s), {} transient",
        pages.len(),
        workers,
        transient
    );

    for option in [RefreshOption::Fast, RefreshOption::Mem, RefreshOption::Tlb] {
        memscatter::refresh::register_default(&session, option)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(StressCounters::default());
    let mut handles = Vec::new();

    for i in 0..workers {
        let (session, pages, stop, counters) =
            (session.clone(), pages.clone(), stop.clone(), counters.clone());
        let seed = seed.wrapping_add(i as u64);
        let handle = thread::Builder::new()
            .name(format!("stress-{}", i))
            .spawn(move || worker_loop(session, pages, seed, stop, counters, None))
            .map_err(|e| ScatterError::thread(e, "failed to spawn stress worker"))?;
        handles.push(handle);
    }

    // Keeps `transient` short-lived workers in flight, each running a few batches
    let spawner = {
        let (session, pages, stop, counters) =
            (session.clone(), pages.clone(), stop.clone(), counters.clone());
        thread::Builder::new()
            .name("stress-transient".to_string())
            .spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed ^ 0x5eed);
                let mut in_flight: Vec<thread::JoinHandle<()>> = Vec::new();
                while !stop.load(Ordering::Relaxed) {
                    in_flight.retain(|handle| !handle.is_finished());
                    while in_flight.len() < transient {
                        let (session, pages, stop, counters) =
                            (session.clone(), pages.clone(), stop.clone(), counters.clone());
                        let seed = rng.random::<u64>();
                        let batches = Some(rng.random_range(1..8));
                        counters.transient_spawned.fetch_add(1, Ordering::Relaxed);
                        match thread::Builder::new()
                            .name("stress-transient-worker".to_string())
                            .spawn(move || {
                                worker_loop(session, pages, seed, stop, counters, batches)
                            })
                        {
                            Ok(handle) => in_flight.push(handle),
                            Err(e) => {
                                log::error!("failed to spawn transient worker: {}", e);
                                break;
                            }
                        }
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                for handle in in_flight {
                    let _ = handle.join();
                }
            })
            .map_err(|e| ScatterError::thread(e, "failed to spawn transient spawner"))?
    };
    handles.push(spawner);

    let start = Instant::now();
    let mut last_batches = 0u64;
    while start.elapsed() < duration {
        thread::sleep(status_every.min(duration.saturating_sub(start.elapsed())));
        let batches = counters.batches.load(Ordering::Relaxed);
        println!(
            "[{:>6.1}s] batches: {} (+{}), reads: {}, failed: {}, transient spawned: {}, \
             pool hit rate: {:.1}%",
            start.elapsed().as_secs_f64(),
            batches,
            batches - last_batches,
            counters.reads.load(Ordering::Relaxed),
            counters.failed.load(Ordering::Relaxed),
            counters.transient_spawned.load(Ordering::Relaxed),
            session.buffer_pool().stats().hit_rate() * 100.0
        );
        last_batches = batches;
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    session.dispose();

    let stats = session.stats().snapshot();
    println!("\nResults:");
    println!("  {}", stats.summary());
    println!("  Read failure rate: {:.2}%", stats.read_failure_rate() * 100.0);
    println!("  {}", session.buffer_pool().stats().summary());
    println!("  Transport: {:?}", transport.stats());
    Ok(())
}

fn handle_chain(matches: &ArgMatches) -> Result<()> {
    let count: u64 = parse_arg(matches, "count")?;
    let pid = Pid(4242);
    let table = 0x1_0000u64;
    let names = 0x8_0000u64;

    let transport = Arc::new(LoopbackTransport::new());
    for i in 0..count {
        let name_address = names + i * 0x40;
        transport.write_memory(pid, table + i * 8, &name_address.to_le_bytes());
        let mut name = [0u8; 16];
        let text = format!("object-{}", i);
        let len = text.len().min(name.len());
        name[..len].copy_from_slice(&text.as_bytes()[..len]);
        transport.write_memory(pid, name_address, &name);
    }

    let session = Session::new(transport.clone())?;
    let map = session.round_map(pid)?;
    let pointers = map.add_round()?;
    let targets = map.add_round()?;
    let resolved = Arc::new(Mutex::new(Vec::new()));

    for i in 0..count {
        let targets = targets.clone();
        let resolved = resolved.clone();
        pointers.prepare_read_with(table + i * 8, 8, move |completion| {
            let Ok(Some(pointer)) = completion.read_u64() else {
                log::warn!("pointer {} unreadable", i);
                return;
            };
            let resolved = resolved.clone();
            let prepared = targets.prepare_read_with(pointer, 16, move |target| {
                if let Ok(Some(bytes)) = target.read() {
                    let text = String::from_utf8_lossy(&bytes)
                        .trim_end_matches('\0')
                        .to_string();
                    if let Ok(mut resolved) = resolved.lock() {
                        resolved.push((i, target.address(), text));
                    }
                }
            });
            if let Err(e) = prepared {
                log::warn!("could not chain pointer {}: {}", i, e);
            }
        })?;
    }

    let start = Instant::now();
    map.execute()?;
    let elapsed = start.elapsed();

    let resolved = resolved.lock().unwrap_or_else(PoisonError::into_inner);
    for (index, address, text) in resolved.iter() {
        println!("  [{:>3}] {:#x} -> {}", index, address, text);
    }
    println!("\nResolved {} of {} pointer(s) in {:?}", resolved.len(), count, elapsed);
    println!("  Round trips: {}", transport.stats().executes);
    map.dispose()?;
    session.dispose();
    Ok(())
}

fn handle_refresh(matches: &ArgMatches) -> Result<()> {
    let duration = Duration::from_secs(parse_arg(matches, "duration")?);
    let interval = match matches.value_of("interval") {
        Some(_) => Some(Duration::from_millis(parse_arg(matches, "interval")?)),
        None => None,
    };
    let options: Vec<RefreshOption> = match matches.values_of("option") {
        Some(values) => values
            .map(|name| {
                RefreshOption::from_name(name).ok_or_else(|| {
                    ScatterError::invalid_parameter("option", format!("Unknown option '{}'", name))
                })
            })
            .collect::<Result<_>>()?,
        None => vec![RefreshOption::Fast, RefreshOption::Mem, RefreshOption::Tlb],
    };

    let transport = Arc::new(LoopbackTransport::new());
    let session = Session::new(transport.clone())?;

    for option in &options {
        let every = interval.unwrap_or_else(|| option.default_interval());
        memscatter::refresh::register(&session, *option, every)?;
        println!("Registered {} every {:?}", option, every);
    }

    thread::sleep(duration);
    let stopped = memscatter::refresh::unregister_all(&session);

    println!("\nResults after {:?}:", duration);
    for option in &options {
        println!(
            "  {:<12} {:#018x}: {} tick(s)",
            option.name(),
            option.id(),
            transport.config_calls(option.id())
        );
    }
    println!("  Schedulers stopped: {}", stopped);
    println!("  {}", session.stats().snapshot().summary());
    session.dispose();
    Ok(())
}

fn show_info() -> Result<()> {
    println!("Memscatter v{}", memscatter::VERSION);
    println!("Batched scatter reads and writes against live target memory");
    println!();
    println!("Configuration:");
    println!("  Page size: {:#x}", PAGE_SIZE);
    println!("  Max request length: {:#x}", memscatter::config::MAX_REQUEST_LENGTH);
    let pool = BufferPoolConfig::new("default");
    println!(
        "  Pool size classes: {} .. {} bytes",
        pool.min_size_class, pool.max_size_class
    );
    println!("  Pool retention cap: {} bytes", pool.max_retained_bytes());
    println!();
    println!("Refresh options:");
    for option in RefreshOption::ALL_OPTIONS {
        println!(
            "  {:<12} {:#018x} (default {:?})",
            option.name(),
            option.id(),
            option.default_interval()
        );
    }
    Ok(())
}

//! Throughput harness. Drives the library exclusively through the exported
//! framework table, the way an out-of-process client would after `dlopen`.
use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use soque::ffi::{soque_framework, SoqueFramework, SoqueHandle, SOQUE_MAJOR, SOQUE_MINOR};
use std::os::raw::{c_char, c_uint, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "soque-bench", about = "strict-order queue throughput harness")]
struct Args {
    /// Ring size of every queue
    #[arg(default_value_t = 2048)]
    queue_size: u32,

    /// Number of queues
    #[arg(default_value_t = 2)]
    queue_count: u32,

    /// Worker threads; 0 means one per hardware thread
    #[arg(default_value_t = 0)]
    threads_count: u32,

    /// Pin workers to cores (0/1)
    #[arg(default_value_t = 1)]
    bind: u8,

    /// Per-claim batch size
    #[arg(default_value_t = 64)]
    batch: u32,

    /// Items per second that make a worker count as busy
    #[arg(default_value_t = 10_000)]
    threshold: u32,

    /// Conductor sampling interval, milliseconds
    #[arg(default_value_t = 50)]
    reaction: u32,

    /// Spin iterations burned per processed item
    #[arg(default_value_t = 1000)]
    proctsc: u64,
}

static G_PROC_COUNT: AtomicU64 = AtomicU64::new(0);
static G_PROCTSC: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn bench_io_cb(_arg: *mut c_void, count: c_uint, _waitable: c_char) -> c_uint {
    count
}

unsafe extern "C" fn bench_proc_cb(_arg: *mut c_void, count: c_uint, _index: c_uint) {
    let spin = G_PROCTSC.load(Ordering::Relaxed) * u64::from(count);
    for _ in 0..spin {
        std::hint::spin_loop();
    }
    G_PROC_COUNT.fetch_add(u64::from(count), Ordering::Relaxed);
}

fn load_framework() -> Result<&'static SoqueFramework> {
    let soq = unsafe { &*soque_framework() };
    if soq.major != SOQUE_MAJOR {
        bail!(
            "framework major version {} does not match expected {}",
            soq.major,
            SOQUE_MAJOR
        );
    }
    if soq.minor != SOQUE_MINOR {
        warn!(
            "framework minor version {} differs from expected {}",
            soq.minor, SOQUE_MINOR
        );
    }
    Ok(soq)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.queue_size < 2 {
        bail!("queue_size must be at least 2");
    }
    if args.queue_count == 0 {
        bail!("queue_count must be at least 1");
    }

    info!("queue_size = {}", args.queue_size);
    info!("queue_count = {}", args.queue_count);
    info!("threads_count = {}", args.threads_count);
    info!("bind = {}", args.bind);
    info!("batch = {}", args.batch);
    info!("threshold = {}", args.threshold);
    info!("reaction = {}", args.reaction);
    info!("proctsc = {}", args.proctsc);

    let soq = load_framework()?;
    G_PROCTSC.store(args.proctsc, Ordering::Relaxed);

    let mut queues: Vec<SoqueHandle> = Vec::with_capacity(args.queue_count as usize);
    for _ in 0..args.queue_count {
        let sh = unsafe {
            (soq.open)(
                args.queue_size,
                ptr::null_mut(),
                bench_io_cb,
                bench_proc_cb,
                bench_io_cb,
            )
        };
        if sh.is_null() {
            bail!("soque_open failed");
        }
        queues.push(sh);
    }

    let sth = unsafe {
        (soq.threads_open)(
            args.threads_count,
            args.bind as c_char,
            queues.as_ptr(),
            args.queue_count,
        )
    };
    if sth.is_null() {
        bail!("soque_threads_open failed");
    }
    unsafe { (soq.threads_tune)(sth, args.batch, args.threshold, args.reaction) };

    // Warming.
    thread::sleep(Duration::from_secs(1));

    let mut speed_moment = 0.0f64;
    let mut speed_approx = 0.0f64;
    let mut n = 0u64;
    loop {
        let speed_save = G_PROC_COUNT.load(Ordering::Relaxed);
        thread::sleep(Duration::from_secs(1));
        let speed_change = speed_moment;
        let speed_approx_change = speed_approx;
        speed_moment = (G_PROC_COUNT.load(Ordering::Relaxed) - speed_save) as f64;
        speed_approx = (speed_approx * n as f64 + speed_moment) / (n as f64 + 1.0);
        println!(
            "Mpps:   {:.3} ({}{:.3})   ~   {:.3} ({}{:.3})",
            speed_moment / 1e6,
            if speed_change <= speed_moment { "+" } else { "" },
            (speed_moment - speed_change) / 1e6,
            speed_approx / 1e6,
            if speed_approx_change <= speed_approx { "+" } else { "" },
            (speed_approx - speed_approx_change) / 1e6
        );
        n += 1;
    }
}

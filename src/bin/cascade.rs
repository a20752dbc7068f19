//! Demo application blocking until a set of workers is done or until it gets interrupted. Each
//! worker owns a guard on its own gate and sleeps for a random amount of time. The main thread
//! waits on any(all(workers), interrupted), the interrupted gate being set upon SIGINT/SIGTERM.
#[macro_use]
extern crate clap;
#[macro_use]
extern crate slog;

use gates::gate::*;
use rand::{thread_rng, Rng};
use slog::{Drain, Level, LevelFilter, Logger};
use slog_async::Async;
use slog_term::{FullFormat, PlainSyncDecorator};
use std::cmp;
use std::io::stderr;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {

    //
    // - parse the CLI line
    //
    let args = clap_app!(cascade =>
        (version: env!("CARGO_PKG_VERSION"))
        (about: "waits for a set of workers to complete")
        (@arg SIZE: -s --size +takes_value "number of workers to run")
        (@arg TIMEOUT: -t --timeout +takes_value "maximum wait in milliseconds")
        (@arg VERBOSE: -v --verbose "trace every gate transition")
    ).get_matches();

    //
    // - init slog to dump on stderr
    //
    let level = if args.is_present("VERBOSE") { Level::Trace } else { Level::Info };
    let decorator = PlainSyncDecorator::new(stderr());
    let formatted = FullFormat::new(decorator).build().fuse();
    let (drain, flush) = Async::new(formatted).build_with_guard();
    let drain = drain.fuse();
    let filter = LevelFilter::new(drain, level).fuse();
    let root = Logger::root(filter, o!());
    let log = root.new(o!("sys" => "main"));
    debug!(&log, "starting (version={})", env!("CARGO_PKG_VERSION"));

    //
    // - cap to 64 workers
    // - the timeout is optional, we block forever by default
    //
    let size = cmp::max(1, cmp::min(value_t!(args, "SIZE", usize).unwrap_or(4), 64));
    let timeout = value_t!(args, "TIMEOUT", u64).ok().map(Duration::from_millis);
    let code = match run(&root, &log, size, timeout) {
        Ok(true) => 0,
        Ok(false) => 2,
        Err(err) => {
            crit!(&log, "failure ({})", err);
            1
        }
    };

    //
    // - the signal handler still holds a logger, flush the async drain
    //   explicitly before exiting
    //
    drop(log);
    drop(root);
    drop(flush);
    process::exit(code);
}

fn run(root: &Logger, log: &Logger, size: usize, timeout: Option<Duration>) -> Result<bool, Errors> {

    //
    // - one base gate per worker plus one for the interruption
    //
    let workers: Vec<_> = (0..size).map(|_| Arc::new(Gate::with_logger(root))).collect();
    let interrupted = Arc::new(Gate::with_logger(root));

    //
    // - trap SIGINT/SIGTERM and set the interrupted gate
    // - we can still run without the handler
    //
    {
        let interrupted = interrupted.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            let _ = interrupted.set();
        })
        {
            warn!(log, "unable to trap signals ({})", err);
        }
    }

    //
    // - combine the gates: we are done once all the workers are done or
    //   once we get interrupted
    //
    let done = {
        let refs: Vec<&Gate> = workers.iter().map(|gate| gate.as_ref()).collect();
        Gate::all(&refs)?
    };
    let exit = Gate::any(&[&done, &*interrupted])?;

    //
    // - spawn the workers, each sleeping for a random time
    // - the guard will set their gate when dropping
    //
    let mut threads = Vec::new();
    for (n, gate) in workers.iter().enumerate() {
        let guard = Gate::guard(gate)?;
        let log = log.new(o!("worker" => n));
        threads.push(thread::spawn(move || {
            let lapse = Duration::from_millis(thread_rng().gen_range(100..1000));
            thread::sleep(lapse);
            info!(&log, "done"; "lapse" => format!("{:?}", lapse));
            drop(guard);
        }));
    }

    info!(log, "waiting on {} workers", size);
    let completed = if exit.wait(timeout) {
        if interrupted.is_set() {
            warn!(log, "interrupted");
        } else {
            info!(log, "all workers done");
        }
        true
    } else {
        let pending = workers.iter().filter(|gate| !gate.is_set()).count();
        warn!(log, "timed out"; "pending" => pending);
        false
    };

    //
    // - detach the derived gates explicitly, youngest first
    // - wait for the workers to wind down
    //
    exit.destruct()?;
    done.destruct()?;
    for tid in threads {
        let _ = tid.join();
    }

    Ok(completed)
}

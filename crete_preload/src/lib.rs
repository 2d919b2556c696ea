//! Startup hook injected into the target through `LD_PRELOAD`.
//!
//! Only glibc exposes the `__libc_start_main` entry this hook overrides. On
//! any other platform the library builds but does nothing; those targets
//! need a different injection mechanism.

// A test harness linking this module would hook its own startup.
#[cfg(all(target_os = "linux", target_env = "gnu", not(test)))]
mod glibc;

use crete_core::JournalBridge;
use crete_core::interceptor::{self, StartupEnvironment, StartupOutcome};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

const LOG_ENV: &str = "CRETE_PRELOAD_LOG";

fn init_logging() {
    // The target may already have a logger of its own.
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, "warn"))
        .try_init();
}

fn fail(err: &crete_core::CreteError) -> ! {
    eprintln!("[crete] {err}");
    std::process::exit(interceptor::exit_code(err));
}

/// Runs the interceptor for the process whose arguments are `argv`.
/// Returns the replacement argv, or `None` to start the target untouched.
/// Never returns on the prime run or on failure.
#[cfg_attr(
    any(not(all(target_os = "linux", target_env = "gnu")), test),
    allow(dead_code)
)]
pub(crate) fn prepare(argv: Vec<Vec<u8>>) -> Option<Vec<Box<[u8]>>> {
    init_logging();

    let program = argv
        .first()
        .map(|arg0| PathBuf::from(OsStr::from_bytes(arg0)))
        .unwrap_or_default();
    let env = StartupEnvironment::from_process(program, cfg!(feature = "host-env"));

    match interceptor::should_activate(&env) {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => fail(&e),
    }

    let mut bridge = match JournalBridge::from_env() {
        Ok(bridge) => bridge,
        Err(e) => fail(&e),
    };

    match interceptor::intercept(&env, argv, &mut bridge) {
        Ok(StartupOutcome::Primed) => std::process::exit(0),
        Ok(StartupOutcome::Applied { argv, symbolic }) => {
            // The engine tracks these addresses until the process exits.
            std::mem::forget(symbolic);
            Some(argv)
        }
        Err(e) => fail(&e),
    }
}

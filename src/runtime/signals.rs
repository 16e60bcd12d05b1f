//! Interrupt handling.
//!
//! SIGINT and SIGTERM are blocked in the calling thread (and every thread it
//! spawns afterwards) and received synchronously by a dedicated watcher
//! thread. The first signal clears the alive flag; a second one exits the
//! process immediately.

use crate::sync::AliveFlag;
use std::io;
use std::thread;
use tracing::{info, warn};

/// Exit status used when a second interrupt forces termination.
const FORCED_EXIT: i32 = 130;

/// Install the watcher. Must be called before any other thread is spawned so
/// the mask is inherited everywhere.
pub fn install(alive: AliveFlag) -> io::Result<()> {
    let set = interrupt_set();

    // SAFETY: `set` is an initialized sigset_t and the old mask is not requested.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || watch(set, alive))?;
    Ok(())
}

fn interrupt_set() -> libc::sigset_t {
    // SAFETY: sigemptyset fully initializes the zeroed set before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        set
    }
}

fn watch(set: libc::sigset_t, alive: AliveFlag) {
    loop {
        let mut signal: libc::c_int = 0;
        // SAFETY: both pointers refer to live locals.
        let rc = unsafe { libc::sigwait(&set, &mut signal) };
        if rc != 0 {
            warn!(error = %io::Error::from_raw_os_error(rc), "sigwait failed, interrupts disabled");
            return;
        }

        if alive.is_alive() {
            info!(signal, "Interrupt received, shutting down");
            alive.kill();
        } else {
            warn!(signal, "Second interrupt, exiting immediately");
            std::process::exit(FORCED_EXIT);
        }
    }
}

//! Per-run execution timeout.
//!
//! A POSIX interval timer delivers `SIGRTMIN` to the thread that armed it.
//! The signal interrupts `KVM_RUN` with `EINTR`; the handler only records
//! the expiry in a thread-local flag that the run loop checks.
//!
//! The timer repeats every [`TIMER_INTERVAL`] after the first expiry so a
//! signal that lands outside `KVM_RUN` is followed by another one.

use std::cell::Cell;
use std::sync::OnceLock;
use std::time::Duration;

use libc::{c_int, c_void, siginfo_t};
use log::debug;
use vmm_sys_util::errno;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

/// Period of the timer after its first expiry.
pub const TIMER_INTERVAL: Duration = Duration::from_millis(20);

thread_local! {
    static TIMER_FIRED: Cell<bool> = const { Cell::new(false) };
}

extern "C" fn handle_timer_signal(_num: c_int, _info: *mut siginfo_t, _ctx: *mut c_void) {
    TIMER_FIRED.with(|fired| fired.set(true));
}

fn install_handler() -> Result<(), errno::Error> {
    static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();
    let result = INSTALLED.get_or_init(|| {
        register_signal_handler(SIGRTMIN(), handle_timer_signal).map_err(|e| e.errno())
    });
    (*result).map_err(errno::Error::new)
}

/// Whether this thread's timer has expired since it was armed.
pub fn timer_fired() -> bool {
    TIMER_FIRED.with(Cell::get)
}

/// Read and clear this thread's expiry flag.
pub fn take_fired() -> bool {
    TIMER_FIRED.with(|fired| fired.replace(false))
}

/// Timer settings for a first expiry after `ticks` milliseconds.
pub fn itimerspec_for(ticks: u32) -> libc::itimerspec {
    let first = Duration::from_millis(u64::from(ticks));
    libc::itimerspec {
        it_interval: timespec(TIMER_INTERVAL),
        it_value: timespec(first),
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// An armed timer.  Dropping it disarms and deletes it.
#[derive(Debug)]
pub struct ExecutionTimer {
    id: libc::timer_t,
}

impl ExecutionTimer {
    /// Arm a timer for the calling thread.  `ticks == 0` means no limit.
    pub fn arm(ticks: u32) -> Result<Option<Self>, errno::Error> {
        TIMER_FIRED.with(|fired| fired.set(false));
        if ticks == 0 {
            return Ok(None);
        }
        install_handler()?;

        // SAFETY: sigevent is plain data; zero is a valid starting point.
        let mut event: libc::sigevent = unsafe { std::mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = SIGRTMIN();
        // SAFETY: gettid has no preconditions.
        event.sigev_notify_thread_id = unsafe { libc::syscall(libc::SYS_gettid) } as c_int;

        let mut id: libc::timer_t = std::ptr::null_mut();
        // SAFETY: event and id are valid for the call.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut id) } != 0 {
            return Err(errno::Error::last());
        }
        let timer = Self { id };

        let spec = itimerspec_for(ticks);
        // SAFETY: id was just created; spec lives across the call.
        if unsafe { libc::timer_settime(timer.id, 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(errno::Error::last());
        }
        debug!("Execution timer armed: {ticks} ms");
        Ok(Some(timer))
    }
}

impl Drop for ExecutionTimer {
    fn drop(&mut self) {
        let off = libc::itimerspec {
            it_interval: timespec(Duration::ZERO),
            it_value: timespec(Duration::ZERO),
        };
        // SAFETY: id is a live timer owned by self.
        unsafe {
            libc::timer_settime(self.id, 0, &off, std::ptr::null_mut());
            libc::timer_delete(self.id);
        }
        TIMER_FIRED.with(|fired| fired.set(false));
    }
}

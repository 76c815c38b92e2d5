use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Raw flag the OS-level handler writes. An async-signal handler can only
/// touch process-global state, so a small bridge thread copies this into the
/// `Arc` the pipeline actually polls.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Arm interrupt handling and mirror the first signal into `flag`.
///
/// Handlers are registered one-shot: the first SIGINT/SIGTERM requests a
/// cooperative stop, and the disposition reverts to the default so a second
/// signal terminates the process outright. That escape hatch matters when an
/// in-flight upload is stuck in unbounded transport retry.
pub(crate) fn install(flag: Arc<AtomicBool>) {
    register_handlers();
    std::thread::spawn(move || {
        while !INTERRUPTED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
        flag.store(true, Ordering::SeqCst);
    });
}

#[cfg(unix)]
fn register_handlers() {
    // SA_RESETHAND restores the default disposition as the handler fires,
    // which gives the one-shot behavior without re-registering from inside
    // the handler itself.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = mark_interrupted as libc::sighandler_t;
        action.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

// Async-signal-safe: a single atomic store.
#[cfg(unix)]
extern "C" fn mark_interrupted(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(windows)]
fn register_handlers() {
    use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;
    unsafe {
        SetConsoleCtrlHandler(Some(mark_interrupted), 1);
    }
}

#[cfg(windows)]
unsafe extern "system" fn mark_interrupted(event: u32) -> i32 {
    use windows_sys::Win32::System::Console::{
        SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT,
    };
    match event {
        CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT => {
            INTERRUPTED.store(true, Ordering::SeqCst);
            // Deregister for the same one-shot semantics as SA_RESETHAND.
            SetConsoleCtrlHandler(Some(mark_interrupted), 0);
            1
        }
        _ => 0,
    }
}

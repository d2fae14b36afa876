//! Cooperative cancellation. A token is checked at iteration boundaries; the interrupt handler
//! only flips a flag, so in-flight reads are always drained before the run stops. It is only
//! installed around the measurement loop.
use crate::error::{Error, Result};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    interruptible: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.interruptible.load(Ordering::SeqCst) && INTERRUPTED.load(Ordering::SeqCst))
    }
}

/// SIGINT routed into a token. Dropping the guard restores the previous handler and
/// detaches the token again.
#[derive(Debug)]
pub struct InterruptGuard {
    previous: libc::sighandler_t,
    interruptible: Arc<AtomicBool>,
}

/// Routes SIGINT into `token` and all of its clones until the returned guard is dropped.
/// Everything outside the guard keeps the default disposition, so a side blocked on the
/// control channel can still be stopped.
pub fn install_interrupt_handler(token: &CancellationToken) -> Result<InterruptGuard> {
    INTERRUPTED.store(false, Ordering::SeqCst);
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    let previous = unsafe { libc::signal(libc::SIGINT, handler) };
    if previous == libc::SIG_ERR {
        return Err(Error::Config(format!(
            "cannot install the SIGINT handler: {}",
            io::Error::last_os_error()
        )));
    }
    token.interruptible.store(true, Ordering::SeqCst);
    debug!("interrupt handler installed");

    Ok(InterruptGuard {
        previous,
        interruptible: token.interruptible.clone(),
    })
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.interruptible.store(false, Ordering::SeqCst);
        if unsafe { libc::signal(libc::SIGINT, self.previous) } == libc::SIG_ERR {
            warn!("previous SIGINT handler not restored: {}", io::Error::last_os_error());
            return;
        }
        debug!("interrupt handler removed");
    }
}

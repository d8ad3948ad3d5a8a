//! SIGINT capture.
//!
//! The handler only flips an atomic flag; the machine polls it between
//! quanta and applies the three-presses-within-a-second debounce.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

extern "C" fn on_sigint(_signum: libc::c_int) {
    if let Some(flag) = FLAG.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Install the handler and return the flag the machine should poll.
pub fn install() -> Arc<AtomicBool> {
    let flag = FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }
    flag
}

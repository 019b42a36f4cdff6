//! Panic Isolation
//!
//! Completion listeners and executor tasks are user code. A panic inside
//! one must not unwind through a result-handler worker, the timer thread,
//! or a caller holding pooled resources. [`run_isolated`] contains the
//! unwind and reports it as a log event.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Information about a contained panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    /// Panic message, if it was a string payload.
    pub message: String,
    /// Name of the thread the panic happened on.
    pub thread_name: Option<String>,
}

/// Run `f`, converting a panic into a [`PanicReport`].
pub fn catch_panic<F, R>(f: F) -> Result<R, PanicReport>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| PanicReport {
        message: payload_message(payload.as_ref()),
        thread_name: std::thread::current().name().map(str::to_string),
    })
}

/// Run `f` and log any panic under `context` instead of propagating it.
///
/// Returns `true` if `f` ran to completion.
pub fn run_isolated<F>(context: &'static str, f: F) -> bool
where
    F: FnOnce(),
{
    match catch_panic(f) {
        Ok(()) => true,
        Err(report) => {
            tracing::error!(
                context,
                panic = %report.message,
                thread = report.thread_name.as_deref().unwrap_or("<unnamed>"),
                "panic contained"
            );
            false
        }
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_panic_ok() {
        assert_eq!(catch_panic(|| 7), Ok(7));
    }

    #[test]
    fn test_catch_panic_str_payload() {
        let report = catch_panic(|| panic!("listener blew up")).unwrap_err();
        assert_eq!(report.message, "listener blew up");
    }

    #[test]
    fn test_catch_panic_string_payload() {
        let report = catch_panic(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(report.message, "formatted 1");
    }

    #[test]
    fn test_run_isolated_reports_outcome() {
        assert!(run_isolated("test", || {}));
        assert!(!run_isolated("test", || panic!("boom")));
    }
}

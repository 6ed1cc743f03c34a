/// Perform a runtime assertion, but if it fails in a release build, log an error rather than
/// taking down the queue or worker with a panic.
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let check: bool = $check;
        debug_assert!(check);
        if !check {
            tracing::error!($($field)*)
        }
    }}
}

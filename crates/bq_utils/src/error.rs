use crate::net_protocol::ids::WorkerId;
use anyhow::{anyhow, Error};

/// Opaque thread-safe error.
/// Only use this when the error is unrecoverable and intended to reach a sink,
/// like the tracing logs of a connection handler.
pub type AnyError = Error;

#[derive(Debug)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

/// An error with the source location it was raised at.
#[derive(Debug)]
pub struct LocatedError {
    pub error: AnyError,
    pub location: &'static Location,
}

impl std::error::Error for LocatedError {}

impl std::fmt::Display for LocatedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            error,
            location: Location { file, line, column },
        } = self;
        write!(f, "{error} at {file}@{line}:{column}")
    }
}

pub type OpaqueResult<T> = Result<T, LocatedError>;

pub trait ResultLocation<T> {
    fn located(self, location: &'static Location) -> OpaqueResult<T>;
}

impl<T, E: Into<Box<dyn std::error::Error + Send + Sync>>> ResultLocation<T> for Result<T, E> {
    #[inline]
    fn located(self, location: &'static Location) -> OpaqueResult<T> {
        self.map_err(|error| error.located(location))
    }
}

pub trait ErrorLocation {
    fn located(self, location: &'static Location) -> LocatedError;
}

impl<E: Into<Box<dyn std::error::Error + Send + Sync>>> ErrorLocation for E {
    #[inline]
    fn located(self, location: &'static Location) -> LocatedError {
        let boxed: Box<dyn std::error::Error + Send + Sync> = self.into();
        LocatedError {
            error: anyhow!(boxed),
            location,
        }
    }
}

/// A located error, attributed to the worker whose request caused it, if that worker is known.
#[derive(Debug)]
pub struct WorkerfulError {
    pub error: LocatedError,
    pub worker_id: Option<WorkerId>,
}

pub trait ErrorWorker<T> {
    fn no_worker(self) -> Result<T, WorkerfulError>;
    fn worker(self, worker_id: &WorkerId) -> Result<T, WorkerfulError>;
}

impl<T> ErrorWorker<T> for OpaqueResult<T> {
    #[inline]
    fn no_worker(self) -> Result<T, WorkerfulError> {
        self.map_err(|error| WorkerfulError {
            error,
            worker_id: None,
        })
    }

    #[inline]
    fn worker(self, worker_id: &WorkerId) -> Result<T, WorkerfulError> {
        self.map_err(|error| WorkerfulError {
            error,
            worker_id: Some(worker_id.clone()),
        })
    }
}

pub use crate::here;

#[macro_export]
macro_rules! here {
    () => {
        &$crate::error::Location {
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

pub use crate::log_workerful_error;

#[macro_export]
macro_rules! log_workerful_error {
    ($err:expr, $($field:tt)*) => {{
        let $crate::error::WorkerfulError {
            error:
                $crate::error::LocatedError {
                    error,
                    location: $crate::error::Location { file, line, column },
                },
            worker_id,
        } = $err;
        match worker_id {
            Some(worker_id) => {
                tracing::error!(
                    worker_id=%worker_id,
                    file,
                    line,
                    column,
                    $($field)*,
                    error
                );
            }
            None => {
                tracing::error!(
                    worker_id="<unknown>",
                    file,
                    line,
                    column,
                    $($field)*,
                    error
                );
            }
        }
    }};
}

#[cfg(test)]
mod test {
    use super::{ErrorWorker, ResultLocation};
    use crate::net_protocol::ids::WorkerId;

    #[test]
    fn located_error_displays_location() {
        let result: Result<(), &str> = Err("boom");
        let error = result.located(here!()).unwrap_err();
        let shown = error.to_string();
        assert!(shown.starts_with("boom at "), "{shown}");
        assert!(shown.contains("error.rs@"), "{shown}");
    }

    #[test]
    fn attributes_worker() {
        let result: Result<(), &str> = Err("boom");
        let error = result
            .located(here!())
            .worker(&WorkerId::from("w1"))
            .unwrap_err();
        assert_eq!(error.worker_id, Some(WorkerId::from("w1")));
    }
}

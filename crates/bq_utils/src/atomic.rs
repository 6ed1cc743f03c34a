use std::sync::atomic::Ordering;

/// Ordering used for every atomic in bq. Nothing here is hot enough to warrant anything weaker.
pub const ORDERING: Ordering = Ordering::SeqCst;

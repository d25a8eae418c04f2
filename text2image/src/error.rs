use std::error::Error;

/// Boxed error that can be sent across threads.
///
/// Used at trait boundaries, where the concrete error type depends on
/// the implementation behind the trait object.
pub type BoxedError = Box<dyn Error + Send + Sync>;

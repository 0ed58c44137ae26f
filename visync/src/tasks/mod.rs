pub(crate) mod fake;
pub(crate) mod serial;

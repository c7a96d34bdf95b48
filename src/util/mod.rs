//! Internal utilities.

pub(crate) mod guard;

pub(crate) use guard::call_guarded;

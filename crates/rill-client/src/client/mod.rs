pub(crate) mod client;
pub(crate) mod registry;
pub(crate) mod session;
pub(crate) mod subscription;
pub(crate) mod waiters;

pub(crate) mod geometry;
pub(crate) mod provision;
pub(crate) mod shared;
pub(crate) mod stats;
pub(crate) mod system;

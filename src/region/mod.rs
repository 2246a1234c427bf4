pub(crate) mod context;
pub(crate) mod lifecycle;
pub(crate) mod reader;
pub(crate) mod reclaim;

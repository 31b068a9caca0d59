pub mod affinity;
pub mod logging;
pub mod version;

pub mod prelude;

pub use parallax_comm as comm;
pub use parallax_core as core;
pub use parallax_cpu as cpu;
pub use parallax_dispatch as dispatch;
pub use parallax_graph as graph;
pub use parallax_parallel as parallel;

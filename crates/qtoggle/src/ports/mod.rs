//! Port runtime: attribute model, per-port queues and workers, sequences.

mod attrs;
mod port;
mod queue;
mod sequence;
mod timed_set;
mod workers;

pub use attrs::{
    AttrDef, AttrType, Choice, PortTraits, PortType, attrdefs_schema, check_number,
    is_standard, load_order, standard_attrdefs,
};
pub use port::{HistorySettings, Port, PortHost, WriteCompletion, adapt_value};
pub use queue::BoundedQueue;
pub use sequence::Sequence;
pub use timed_set::TimedSet;

pub mod adapter;
pub mod poller;

pub use adapter::{ChangeChannel, Handler, Predicate};
pub use poller::{jittered_period, Poller};

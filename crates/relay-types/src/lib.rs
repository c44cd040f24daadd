mod budget;
mod contract;
mod event;
mod fact;
mod routing;
mod snapshot;

pub use budget::*;
pub use contract::*;
pub use event::*;
pub use fact::*;
pub use routing::*;
pub use snapshot::*;

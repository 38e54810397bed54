//! Upstream monitors: one polling engine, two selection policies.

mod engine;
mod event;
mod events;
mod live;
mod selection;

pub use engine::{Monitor, MonitorState};
pub use event::{Admission, EventSelection};
pub use events::MonitorEvent;
pub use live::LiveSelection;
pub use selection::{FetchLedger, SelectionContext, SelectionPolicy};

pub type LiveMonitor = Monitor<LiveSelection>;
pub type EventMonitor = Monitor<EventSelection>;

// Events Module - typed events, handlers, and the priority dispatcher

pub mod dispatcher;
pub mod handler;
pub mod types;

pub use dispatcher::{DeliveryReceipt, EventDispatcher, EventPublisher};
pub use handler::{handler_fn, EventHandler, FnHandler};
pub use types::{Event, EventType};

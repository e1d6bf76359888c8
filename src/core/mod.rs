pub mod dispatcher;
pub mod forward;
pub mod instrumentation;
pub mod routing;

pub use dispatcher::Dispatcher;
pub use forward::{ClientConnection, ForwardError, ForwardHandler};
pub use instrumentation::{InFlightResponseState, InstrumentedSink};
pub use routing::{BackendRoute, RoutingTable};

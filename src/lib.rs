pub mod app;

pub use app::discovery::{AsyncDeviceManager, DiscoveryEvent, DiscoveryRequest, EventEmitter};
pub use app::dispatcher::{shared_dispatcher, TaskContext, TaskControl, TaskDispatcher, TaskHandle, TaskSignals};
pub use app::error::AppError;

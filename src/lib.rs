pub mod bridge;
pub mod protocol;
pub mod storage;
pub mod tasks;

pub use bridge::{Bridge, BridgeConfig};
pub use protocol::{Message, Supervisor, SupervisorHandle};
pub use storage::{SensorStore, StorageFacade};

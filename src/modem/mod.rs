//! Cellular modem: the shared AT channel, the data session controller and
//! the status poller. Both workers go through the same [`at::SharedAtChannel`].

pub mod at;
pub mod data;
pub mod poller;

pub use at::{AtChannel, ModemError, SerialAtChannel, SharedAtChannel};
pub use data::{DataConnectedEvent, InterfaceAddress, IpCommand, ModemDataController};
pub use poller::modem_poller;

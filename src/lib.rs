// Peripheral task framework
// Each peripheral runs on its own task behind an entry guard, a one-deep mailbox
// and a notification word; the System brings them up in order and tears them down.

pub mod display;
pub mod entry_guard;
pub mod i2c;
pub mod lifecycle;
pub mod mailbox;
pub mod notification;
pub mod protocol;
pub mod route_log;
pub mod settings;
pub mod sim;
pub mod spi;
pub mod state_machine;
pub mod system;
pub mod wifi;

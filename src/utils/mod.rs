pub mod command;
pub mod logger;
pub mod process;
pub mod sysctl;

pub use command::CommandExecutor;
pub use logger::{Logger, Timer};
pub use process::ProcessUtils;
pub use sysctl::Sysctl;

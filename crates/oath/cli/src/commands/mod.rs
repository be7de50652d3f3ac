// Command handlers
mod card_operations;
mod credentials;
mod watch;

pub use card_operations::*;
pub use credentials::*;
pub use watch::*;

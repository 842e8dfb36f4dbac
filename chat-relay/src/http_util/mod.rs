mod connect;

pub use self::connect::{Sender, connect};

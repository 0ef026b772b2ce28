pub mod codec;
pub mod store;
pub mod time;

pub use codec::*;
pub use store::*;
pub use time::*;

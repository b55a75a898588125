mod postgres;
mod reference;

pub use postgres::*;
pub use reference::*;
